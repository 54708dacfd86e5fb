use std::sync::Arc;
use std::time::Duration;

use trailmark_api::app::{AppState, build_app};
use trailmark_api::config::Config;
use trailmark_fulfillment::WebhookAuthenticator;
use trailmark_infra::checkout::CheckoutService;
use trailmark_infra::clients::{LoggingMailer, PartnerClient, ProcessorClient};
use trailmark_infra::dispatch::{DispatchConfig, ProductionDispatchScheduler};
use trailmark_infra::fulfillment_processor::FulfillmentWebhookProcessor;
use trailmark_infra::payment_processor::{PaymentProcessorConfig, PaymentWebhookProcessor};
use trailmark_infra::store::PostgresStore;
use trailmark_payments::SignatureVerifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trailmark_observability::init();

    let config = Config::from_env()?;

    let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
    store.migrate().await?;

    // External collaborators, constructed once and injected everywhere.
    let intents = Arc::new(ProcessorClient::new(
        config.processor_base_url.clone(),
        config.processor_secret_key.clone(),
    ));
    let partner = Arc::new(PartnerClient::new(
        config.partner_base_url.clone(),
        config.partner_api_key.clone(),
    ));
    let mailer = Arc::new(LoggingMailer);

    let authenticator = if config.partner_webhook_verify {
        WebhookAuthenticator::new(config.partner_webhook_secret.as_bytes().to_vec())
    } else {
        tracing::warn!("partner webhook signature verification disabled (development only)");
        WebhookAuthenticator::disabled()
    };

    let state = Arc::new(AppState {
        checkout: CheckoutService::new(store.clone(), intents),
        payment_webhooks: PaymentWebhookProcessor::new(
            store.clone(),
            mailer.clone(),
            PaymentProcessorConfig {
                allow_test_events: config.allow_test_events,
            },
        ),
        fulfillment_webhooks: FulfillmentWebhookProcessor::new(
            store.clone(),
            authenticator,
            mailer.clone(),
        ),
        store: store.clone(),
        payment_signature: SignatureVerifier::new(config.processor_webhook_secret.as_bytes()),
        internal_token: config.internal_api_token.clone(),
    });

    let scheduler =
        ProductionDispatchScheduler::new(store, partner, mailer, DispatchConfig::default());
    let interval = Duration::from_secs(config.dispatch_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = scheduler.run_once().await {
                tracing::error!(error = %err, "dispatch run failed");
            }
        }
    });

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
