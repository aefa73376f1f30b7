use std::sync::Arc;

use serde::Serialize;

use crate::{
    config::{OpenAIConfig, non_empty},
    providers::ProviderClient,
    proxy::{PLACEHOLDER, ProxySelector},
};

/// Diagnostic summary returned by the config endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfigReport {
    pub api_model: String,
    pub reverse_proxy: String,
    pub timeout_ms: u64,
    pub socks_proxy: String,
    pub https_proxy: String,
    pub balance: String,
}

/// Best-effort balance lookup plus a summary of the active configuration
pub struct ConfigReporter {
    provider: Arc<ProviderClient>,
    proxy: ProxySelector,
    reverse_proxy: Option<String>,
}

impl ConfigReporter {
    pub fn new(provider: Arc<ProviderClient>, proxy: ProxySelector, openai: &OpenAIConfig) -> Self {
        Self {
            provider,
            proxy,
            reverse_proxy: non_empty(&openai.api_reverse_proxy).map(str::to_string),
        }
    }

    /// Never fails: any balance problem is reported as the placeholder
    pub async fn report(&self) -> ChatConfigReport {
        let summary = self.proxy.summary();

        ChatConfigReport {
            api_model: self.provider.mode().as_str().to_string(),
            reverse_proxy: self
                .reverse_proxy
                .clone()
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            timeout_ms: self.provider.timeout().as_millis() as u64,
            socks_proxy: summary.socks_proxy,
            https_proxy: summary.https_proxy,
            balance: self.balance().await,
        }
    }

    async fn balance(&self) -> String {
        match self.provider.fetch_balance().await {
            Some(Ok(balance)) => format!("{:.3}", balance),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Balance query failed");
                PLACEHOLDER.to_string()
            }
            None => PLACEHOLDER.to_string(),
        }
    }
}
