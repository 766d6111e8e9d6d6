use crate::hub::DEFAULT_EVENT_BUFFER;
use crate::lifecycle::LifecycleTiming;
use crate::types::{WebhookConfig, DEFAULT_WEBHOOK_RETRIES, DEFAULT_WEBHOOK_TIMEOUT_MS};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_SYSTEM_NUMBER: &str = "+15551234567";
pub const DEFAULT_SYSTEM_PREFIX: &str = "+1555123";

#[derive(Debug, Parser)]
#[command(name = "nexus-sms-simulator", about = "Local SMS provider simulator", version)]
pub struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "SMS_SIM_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "SMS_SIM_PORT", default_value_t = 4001)]
    pub port: u16,

    /// Number used as `from` when a send request omits it.
    #[arg(long, env = "SMS_SIM_SYSTEM_NUMBER", default_value = DEFAULT_SYSTEM_NUMBER)]
    pub system_number: String,

    /// Numbers starting with this prefix belong to the simulator when grouping conversations.
    #[arg(long, env = "SMS_SIM_SYSTEM_PREFIX", default_value = DEFAULT_SYSTEM_PREFIX)]
    pub system_prefix: String,

    /// Delay before a queued message is marked sent.
    #[arg(long, env = "SMS_SIM_SENT_DELAY_MS", default_value_t = 1000)]
    pub sent_delay_ms: u64,

    /// Delay before a sent message is marked delivered.
    #[arg(long, env = "SMS_SIM_DELIVERED_DELAY_MS", default_value_t = 2000)]
    pub delivered_delay_ms: u64,

    /// Probability (0.0 - 1.0) that a sent message fails instead of delivering.
    #[arg(long, env = "SMS_SIM_FAILURE_RATE", default_value_t = 0.0)]
    pub failure_rate: f64,

    /// Endpoint that receives inbound messages.
    #[arg(long, env = "SMS_SIM_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    #[arg(long, env = "SMS_SIM_WEBHOOK_DISABLED")]
    pub webhook_disabled: bool,

    #[arg(long, env = "SMS_SIM_WEBHOOK_RETRIES", default_value_t = DEFAULT_WEBHOOK_RETRIES)]
    pub webhook_retries: u32,

    #[arg(long, env = "SMS_SIM_WEBHOOK_TIMEOUT_MS", default_value_t = DEFAULT_WEBHOOK_TIMEOUT_MS)]
    pub webhook_timeout_ms: u64,

    /// HMAC secret used to sign webhook bodies.
    #[arg(long, env = "SMS_SIM_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    /// Per-viewer event buffer; a viewer that falls further behind loses events.
    #[arg(long, env = "SMS_SIM_EVENT_BUFFER", default_value_t = DEFAULT_EVENT_BUFFER)]
    pub event_buffer: usize,

    /// tracing filter directive, e.g. "info" or "nexus_sms_simulator=debug".
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Cli {
    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("invalid bind address {}:{}: {e}", self.host, self.port))
    }

    pub fn simulator_config(&self) -> Result<SimulatorConfig, String> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(format!(
                "failure rate must be between 0.0 and 1.0, got {}",
                self.failure_rate
            ));
        }
        if self.webhook_retries == 0 {
            return Err("webhook retries must be at least 1".to_string());
        }
        Ok(SimulatorConfig {
            system_number: self.system_number.clone(),
            system_prefix: self.system_prefix.clone(),
            lifecycle: LifecycleTiming {
                sent_after: Duration::from_millis(self.sent_delay_ms),
                delivered_after: Duration::from_millis(self.delivered_delay_ms),
                failure_rate: self.failure_rate,
            },
            webhook: WebhookConfig {
                url: self.webhook_url.clone().filter(|u| !u.trim().is_empty()),
                enabled: !self.webhook_disabled,
                retries: self.webhook_retries,
                timeout_ms: self.webhook_timeout_ms.max(1),
                secret: self.webhook_secret.clone().filter(|s| !s.is_empty()),
            },
            event_buffer: self.event_buffer,
        })
    }
}

/// Everything needed to construct a [`crate::engine::Simulator`].
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub system_number: String,
    pub system_prefix: String,
    pub lifecycle: LifecycleTiming,
    pub webhook: WebhookConfig,
    pub event_buffer: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            system_number: DEFAULT_SYSTEM_NUMBER.to_string(),
            system_prefix: DEFAULT_SYSTEM_PREFIX.to_string(),
            lifecycle: LifecycleTiming::default(),
            webhook: WebhookConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}
