use crate::config::SimulatorConfig;
use crate::conversation::ConversationIndex;
use crate::error::SimError;
use crate::hub::{BroadcastHub, SubscriberId};
use crate::lifecycle::LifecycleScheduler;
use crate::store::MessageStore;
use crate::types::{
    Direction, HubEvent, Message, MessageStatus, NewMessage, ReplyRequest, WebhookEvent,
    MESSAGE_COST,
};
use crate::webhook::{ReqwestTransport, WebhookService, WebhookTransport};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Owns every component of the simulator. Shared as `Arc<Simulator>`.
pub struct Simulator {
    config: SimulatorConfig,
    store: Arc<MessageStore>,
    conversations: ConversationIndex,
    hub: Arc<BroadcastHub>,
    scheduler: LifecycleScheduler,
    webhooks: Arc<WebhookService>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_transport(config, Arc::new(ReqwestTransport::new()))
    }

    pub fn with_transport(config: SimulatorConfig, transport: Arc<dyn WebhookTransport>) -> Self {
        let store = Arc::new(MessageStore::new(config.system_number.clone()));
        let hub = Arc::new(BroadcastHub::new(config.event_buffer));
        let conversations = ConversationIndex::new(store.clone(), config.system_prefix.clone());
        let scheduler = LifecycleScheduler::new(
            store.clone(),
            hub.clone(),
            config.system_prefix.clone(),
            config.lifecycle,
        );
        let webhooks = Arc::new(WebhookService::new(
            config.webhook.clone(),
            transport,
            hub.clone(),
        ));
        Self {
            config,
            store,
            conversations,
            hub,
            scheduler,
            webhooks,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn conversations(&self) -> &ConversationIndex {
        &self.conversations
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn webhooks(&self) -> &WebhookService {
        &self.webhooks
    }

    /// Accept an outbound message. Returns as soon as it is queued; the
    /// lifecycle runs in the background.
    pub async fn send_message(&self, req: NewMessage) -> Result<Message, SimError> {
        let msg = self.store.create(req).await?;
        info!(message_id = %msg.id, to = %msg.to, "message queued");
        let room = self.conversations.room_for(&msg);
        self.hub
            .publish_to_conversation(&room, HubEvent::MessageNew(msg.clone()), None)
            .await;
        self.scheduler.schedule(&msg.id);
        Ok(msg)
    }

    /// Relay a viewer's reply as an inbound message.
    ///
    /// The reply is published to the `to` room, skipping `origin`. Webhook
    /// delivery is spawned and never delays the return.
    pub async fn submit_reply(
        &self,
        req: ReplyRequest,
        origin: Option<SubscriberId>,
    ) -> Result<Message, SimError> {
        let msg = self.store.insert_inbound(req).await?;
        info!(message_id = %msg.id, to = %msg.to, "reply received");
        self.hub
            .publish_to_conversation(&msg.to, HubEvent::MessageNew(msg.clone()), origin)
            .await;

        let webhooks = self.webhooks.clone();
        let inbound = msg.clone();
        tokio::spawn(async move {
            webhooks.deliver(&inbound).await;
        });
        Ok(msg)
    }

    /// Deliver a synthetic inbound message so a developer can check their endpoint.
    pub async fn send_test_webhook(&self) -> WebhookEvent {
        let now = Utc::now();
        let msg = Message {
            id: format!("SMtest{}", Uuid::new_v4().simple()),
            to: self.config.system_number.clone(),
            from: "+15550000000".to_string(),
            body: "Test message from nexus-sms-simulator".to_string(),
            status: MessageStatus::Delivered,
            direction: Direction::Inbound,
            created_at: now,
            delivered_at: Some(now),
            error_message: None,
            cost: MESSAGE_COST,
        };
        self.webhooks.deliver(&msg).await
    }

    /// Remove one message and abandon its pending transitions.
    pub async fn delete_message(&self, id: &str) -> Result<Message, SimError> {
        self.scheduler.cancel(id);
        let msg = self.store.delete(id).await?;
        debug!(message_id = id, "message deleted");
        Ok(msg)
    }

    pub async fn clear_messages(&self) -> usize {
        let removed = self.store.clear().await;
        // Only the removed ids: a message sent concurrently keeps its lifecycle.
        for id in &removed {
            self.scheduler.cancel(id);
        }
        self.hub.publish_global(HubEvent::MessagesCleared).await;
        info!(count = removed.len(), "messages cleared");
        removed.len()
    }

    /// Abandon every pending lifecycle timer.
    pub fn shutdown(&self) {
        let aborted = self.scheduler.cancel_all();
        info!(aborted, "simulator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleTiming;
    use crate::types::{DeliveryStatus, WebhookConfig};
    use crate::webhook::OutboundRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WebhookTransport for CountingTransport {
        async fn post(&self, _request: &OutboundRequest) -> Result<u16, SimError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(200)
        }
    }

    /// Accepts the request and never answers.
    #[derive(Default)]
    struct HangingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WebhookTransport for HangingTransport {
        async fn post(&self, _request: &OutboundRequest) -> Result<u16, SimError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn simulator(webhook: WebhookConfig) -> (Simulator, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport::default());
        let config = SimulatorConfig {
            webhook,
            ..Default::default()
        };
        (Simulator::with_transport(config, transport.clone()), transport)
    }

    async fn next_delivery(events: &mut tokio::sync::mpsc::Receiver<HubEvent>) -> WebhookEvent {
        loop {
            match events.recv().await {
                Some(HubEvent::WebhookDelivery(e)) => return e,
                Some(_) => continue,
                None => panic!("hub closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sent_message_is_queued_then_delivered() {
        let (sim, _) = simulator(WebhookConfig::default());
        let msg = sim
            .send_message(NewMessage::new("+15550001111", "+15551234567", "hi"))
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Queued);

        let LifecycleTiming {
            sent_after,
            delivered_after,
            ..
        } = sim.config().lifecycle;
        tokio::time::sleep(sent_after + delivered_after + Duration::from_millis(10)).await;

        let stored = sim.store().get(&msg.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn invalid_send_touches_nothing() {
        let (sim, _) = simulator(WebhookConfig::default());
        let err = sim
            .send_message(NewMessage::new("+15550001111", "+15551234567", ""))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(sim.store().is_empty().await);
    }

    #[tokio::test]
    async fn reply_with_webhooks_disabled_yields_one_skipped_event() {
        let (sim, transport) = simulator(WebhookConfig {
            url: Some("http://127.0.0.1:9/hook".into()),
            enabled: false,
            ..Default::default()
        });
        let mut viewer = sim.hub().connect().await;

        let msg = sim
            .submit_reply(
                ReplyRequest {
                    to: "+15550001111".into(),
                    from: "+15551234567".into(),
                    body: "YES".into(),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);

        let event = next_delivery(&mut viewer.events).await;
        assert_eq!(event.status, DeliveryStatus::Skipped);
        assert_eq!(event.payload.id, msg.id);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sim.webhooks().history().await.len(), 1);
    }

    #[tokio::test]
    async fn reply_reaches_room_members_only() {
        let (sim, _) = simulator(WebhookConfig::default());
        let mut a = sim.hub().connect().await;
        let mut b = sim.hub().connect().await;
        let mut elsewhere = sim.hub().connect().await;
        sim.hub().join(a.id, "+15550001111").await;
        sim.hub().join(b.id, "+15550001111").await;
        sim.hub().join(elsewhere.id, "+15550002222").await;

        let msg = sim
            .submit_reply(
                ReplyRequest {
                    to: "+15550001111".into(),
                    from: "+15551234567".into(),
                    body: "on my way".into(),
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(a.events.recv().await, Some(HubEvent::MessageNew(msg.clone())));
        assert_eq!(b.events.recv().await, Some(HubEvent::MessageNew(msg)));
        // The only thing the other room sees is the global webhook outcome.
        assert!(matches!(
            elsewhere.events.recv().await,
            Some(HubEvent::WebhookDelivery(_))
        ));
    }

    #[tokio::test]
    async fn reply_skips_the_originating_viewer() {
        let (sim, _) = simulator(WebhookConfig::default());
        let mut author = sim.hub().connect().await;
        let mut watcher = sim.hub().connect().await;
        sim.hub().join(author.id, "+15550001111").await;
        sim.hub().join(watcher.id, "+15550001111").await;

        sim.submit_reply(
            ReplyRequest {
                to: "+15550001111".into(),
                from: "+15551234567".into(),
                body: "ok".into(),
            },
            Some(author.id),
        )
        .await
        .unwrap();

        assert!(matches!(watcher.events.recv().await, Some(HubEvent::MessageNew(_))));
        assert!(matches!(
            author.events.recv().await,
            Some(HubEvent::WebhookDelivery(_))
        ));
    }

    #[tokio::test]
    async fn reply_is_posted_when_configured() {
        let (sim, transport) = simulator(WebhookConfig {
            url: Some("http://127.0.0.1:9/hook".into()),
            ..Default::default()
        });
        let mut viewer = sim.hub().connect().await;
        sim.submit_reply(
            ReplyRequest {
                to: "+15550001111".into(),
                from: "+15551234567".into(),
                body: "hello".into(),
            },
            None,
        )
        .await
        .unwrap();

        let event = next_delivery(&mut viewer.events).await;
        assert_eq!(event.status, DeliveryStatus::Http(200));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_returns_while_webhook_hangs() {
        let transport = Arc::new(HangingTransport::default());
        let config = SimulatorConfig {
            webhook: WebhookConfig {
                url: Some("http://127.0.0.1:9/hook".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let sim = Simulator::with_transport(config, transport.clone());
        let mut member = sim.hub().connect().await;
        sim.hub().join(member.id, "+15550001111").await;
        let start = tokio::time::Instant::now();

        let msg = sim
            .submit_reply(
                ReplyRequest {
                    to: "+15550001111".into(),
                    from: "+15551234567".into(),
                    body: "still there?".into(),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(member.events.try_recv().unwrap(), HubEvent::MessageNew(msg));

        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(tokio::time::Instant::now(), start);
        assert!(member.events.try_recv().is_err());
        assert!(sim.webhooks().history().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_only_cleared_lifecycles() {
        let (sim, _) = simulator(WebhookConfig::default());
        for body in ["one", "two"] {
            sim.send_message(NewMessage::new("+15550001111", "+15551234567", body))
                .await
                .unwrap();
        }
        // Scheduled but not yet in the store when the clear snapshot is taken.
        sim.scheduler.schedule("SMlate");
        assert_eq!(sim.scheduler.pending(), 3);

        assert_eq!(sim.clear_messages().await, 2);
        assert_eq!(sim.scheduler.pending(), 1);
        assert!(sim.scheduler.cancel("SMlate"));

        let survivor = sim
            .send_message(NewMessage::new("+15550001111", "+15551234567", "three"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        let stored = sim.store().get(&survivor.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_lifecycle() {
        let (sim, _) = simulator(WebhookConfig::default());
        let msg = sim
            .send_message(NewMessage::new("+15550001111", "+15551234567", "hi"))
            .await
            .unwrap();
        sim.delete_message(&msg.id).await.unwrap();
        assert!(matches!(
            sim.delete_message(&msg.id).await,
            Err(SimError::NotFound { .. })
        ));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sim.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_webhook_goes_through_delivery_path() {
        let (sim, transport) = simulator(WebhookConfig {
            url: Some("http://127.0.0.1:9/hook".into()),
            ..Default::default()
        });
        let event = sim.send_test_webhook().await;
        assert_eq!(event.status, DeliveryStatus::Http(200));
        assert_eq!(event.payload.to, sim.config().system_number);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
