use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use crate::{
    config::{ProxyConfig, non_empty},
    errors::{AppError, AppResult},
};

/// Placeholder shown for unset values in diagnostic output.
pub const PLACEHOLDER: &str = "-";

/// Outbound network path used for every provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAgent {
    Direct,
    Socks5 { host: String, port: u16 },
    Https { url: String },
}

/// What the config endpoint shows about the outbound path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySummary {
    pub socks_proxy: String,
    pub https_proxy: String,
}

/// 出站代理选择器
///
/// ## 功能说明
/// 启动时根据代理配置选择一次出站路径，之后所有请求复用同一个 HTTP 客户端。
/// 选择顺序：SOCKS 主机和端口都配置时使用 SOCKS5（忽略 HTTPS 代理），
/// 否则使用 HTTPS_PROXY / ALL_PROXY，否则直连。
#[derive(Debug, Clone)]
pub struct ProxySelector {
    agent: ProxyAgent,
}

impl ProxySelector {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let socks_host = non_empty(&config.socks_host);

        let agent = match (socks_host, config.socks_port) {
            (Some(host), Some(port)) => ProxyAgent::Socks5 {
                host: host.to_string(),
                port,
            },
            _ => match config.https_proxy_url() {
                Some(url) => ProxyAgent::Https { url: url.to_string() },
                None => ProxyAgent::Direct,
            },
        };

        Self { agent }
    }

    pub fn agent(&self) -> &ProxyAgent {
        &self.agent
    }

    /// Proxy URL handed to reqwest, `None` for direct connections.
    pub fn proxy_url(&self) -> Option<String> {
        match &self.agent {
            ProxyAgent::Direct => None,
            // socks5h resolves names on the proxy side
            ProxyAgent::Socks5 { host, port } => Some(format!("socks5h://{}:{}", host, port)),
            ProxyAgent::Https { url } => Some(url.clone()),
        }
    }

    pub fn summary(&self) -> ProxySummary {
        match &self.agent {
            ProxyAgent::Direct => ProxySummary {
                socks_proxy: PLACEHOLDER.to_string(),
                https_proxy: PLACEHOLDER.to_string(),
            },
            ProxyAgent::Socks5 { host, port } => ProxySummary {
                socks_proxy: format!("{}:{}", host, port),
                https_proxy: PLACEHOLDER.to_string(),
            },
            ProxyAgent::Https { url } => ProxySummary {
                socks_proxy: PLACEHOLDER.to_string(),
                https_proxy: url.clone(),
            },
        }
    }

    /// Build the shared HTTP client routed through the selected agent
    pub fn build_client(&self) -> AppResult<Client> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90));

        builder = match self.proxy_url() {
            Some(url) => {
                let proxy = reqwest::Proxy::all(&url).map_err(|e| {
                    AppError::ConfigError(format!("Invalid proxy '{}': {}", url, e))
                })?;
                builder.proxy(proxy)
            }
            // ignore ambient HTTP(S)_PROXY so the selection above stays authoritative
            None => builder.no_proxy(),
        };

        tracing::info!(agent = ?self.agent, "Outbound HTTP client configured");

        builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to create HTTP client: {}", e)))
    }
}
