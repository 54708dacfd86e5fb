//! Environment-driven configuration.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,

    pub processor_base_url: String,
    pub processor_secret_key: String,
    pub processor_webhook_secret: String,
    /// Allow non-livemode processor events (test environments only).
    pub allow_test_events: bool,

    pub partner_base_url: String,
    pub partner_api_key: String,
    pub partner_webhook_secret: String,
    /// Development-only escape hatch for partner signature verification.
    pub partner_webhook_verify: bool,

    /// Token granting access to the full (trusted) order view.
    pub internal_api_token: Option<String>,

    /// Seconds between dispatch scheduler runs.
    pub dispatch_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let required =
            |key: &str| std::env::var(key).with_context(|| format!("{key} must be set"));
        let optional = |key: &str| std::env::var(key).ok();
        let flag = |key: &str| {
            std::env::var(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };

        let internal_api_token = optional("INTERNAL_API_TOKEN");
        if internal_api_token.is_none() {
            tracing::warn!("INTERNAL_API_TOKEN not set; trusted order view is disabled");
        }

        Ok(Self {
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: required("DATABASE_URL")?,
            processor_base_url: optional("PROCESSOR_BASE_URL")
                .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            processor_secret_key: required("PROCESSOR_SECRET_KEY")?,
            processor_webhook_secret: required("PROCESSOR_WEBHOOK_SECRET")?,
            allow_test_events: flag("ALLOW_TEST_EVENTS"),
            partner_base_url: required("PARTNER_BASE_URL")?,
            partner_api_key: required("PARTNER_API_KEY")?,
            partner_webhook_secret: required("PARTNER_WEBHOOK_SECRET")?,
            partner_webhook_verify: !flag("PARTNER_WEBHOOK_VERIFY_DISABLED"),
            internal_api_token,
            dispatch_interval_secs: optional("DISPATCH_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        })
    }
}
