use std::sync::Arc;

use neura_actions::HttpTransport;
use neura_core::clock::system_clock;
use neura_core::config::{ConfigError, GatewayConfig, LoadOptions};
use thiserror::Error;
use tracing::info;

use crate::gateway::Gateway;
use crate::sse::StreamSettings;

pub struct Application {
    pub config: GatewayConfig,
    pub gateway: Arc<Gateway>,
    pub streaming: StreamSettings,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("http client construction failed: {0}")]
    HttpClient(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let config = GatewayConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: GatewayConfig) -> Result<Application, BootstrapError> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("neura-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(BootstrapError::HttpClient)?;
    let transport = Arc::new(HttpTransport::new(client));

    let gateway = Arc::new(Gateway::from_config(&config, transport, system_clock()));
    info!(
        event_name = "system.bootstrap.gateway_ready",
        correlation_id = "bootstrap",
        breakers = gateway.breakers().len(),
        default_model = %config.guards.default_model,
        "gateway guards and action generators initialized"
    );

    let streaming = StreamSettings::from(&config.streaming);
    Ok(Application { config, gateway, streaming })
}

#[cfg(test)]
mod tests {
    use neura_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_downstream_url() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                search_base_url: Some("search.internal:9200".to_owned()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("search.base_url"));
    }

    #[tokio::test]
    async fn bootstrap_wires_only_configured_targets() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                model_base_url: Some("https://llm.internal/v1".to_owned()),
                finance_base_url: Some("https://quotes.internal".to_owned()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with valid overrides");

        let targets: Vec<String> =
            app.gateway.breakers().into_iter().map(|breaker| breaker.target).collect();
        assert_eq!(targets, vec!["finance".to_owned(), "model".to_owned()]);
        assert_eq!(app.streaming.buffer, app.config.streaming.buffer);
    }
}
