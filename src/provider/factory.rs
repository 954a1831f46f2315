// QuectoFlow — Provider factory

use super::{http::HTTPProvider, LLMProvider};
use crate::config::{Config, ConfigError};

/// Create an LLM provider from the loaded config.
pub fn create_provider(cfg: &Config) -> anyhow::Result<Box<dyn LLMProvider>> {
    Ok(Box::new(http_provider(cfg)?))
}

fn http_provider(cfg: &Config) -> anyhow::Result<HTTPProvider> {
    let p = &cfg.provider;
    if p.api_key.is_empty() {
        return Err(ConfigError::MissingApiKey.into());
    }

    tracing::info!(
        model = %p.model,
        api_base = %if p.api_base.is_empty() { "(default)" } else { &p.api_base },
        "Creating LLM provider"
    );

    let proxy = if p.proxy.is_empty() {
        None
    } else {
        Some(p.proxy.as_str())
    };

    // Client timeout tracks executor.llm_timeout_secs.
    let provider = HTTPProvider::new(
        p.api_key.clone(),
        p.api_base.clone(),
        proxy,
        p.model.clone(),
        cfg.executor.llm_timeout(),
    )?
    .with_retries(p.max_retries, p.retry_delay_ms);

    Ok(provider)
}
