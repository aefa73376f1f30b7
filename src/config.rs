use serde::{Deserialize, Deserializer, Serialize, de::IgnoredAny};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
    value::{Uncased, UncasedStr},
};
use std::path::Path;
use anyhow::{Context, Result};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// 主配置结构体
///
/// 包含中继服务的所有配置信息，从配置文件和环境变量加载
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// OpenAI 凭据与模型配置
    #[serde(default)]
    pub openai: OpenAIConfig,
    /// 出站代理配置
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// 安全配置（鉴权密钥、限流）
    #[serde(default)]
    pub security: SecurityConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OpenAIConfig {
    /// Direct API key; selects the `ChatGPTAPI` backend when present
    #[serde(default)]
    pub api_key: Option<String>,
    /// Web access token; selects the reverse-proxy backend when no API key is set
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_model: Option<String>,
    #[serde(default)]
    pub api_reverse_proxy: Option<String>,
    /// Unparseable values fall back to the default instead of failing startup
    #[serde(default = "default_timeout_ms", deserialize_with = "lenient_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub socks_host: Option<String>,
    #[serde(default)]
    pub socks_port: Option<u16>,
    #[serde(default)]
    pub https_proxy: Option<String>,
    #[serde(default)]
    pub all_proxy: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SecurityConfig {
    #[serde(default)]
    pub auth_secret_key: Option<String>,
    /// 每小时每个客户端的最大请求数，0 表示不限制
    #[serde(default, deserialize_with = "lenient_request_limit")]
    pub max_request_per_hour: u32,
    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 3002 }
fn default_timeout_ms() -> u64 { 30 * 1000 }
fn default_cors_enabled() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            access_token: None,
            api_base_url: None,
            api_model: None,
            api_reverse_proxy: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auth_secret_key: None,
            max_request_per_hour: 0,
            cors_enabled: default_cors_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// A numeric setting as it may arrive from TOML or a plain environment variable
#[derive(Deserialize)]
#[serde(untagged)]
enum LenientNumber {
    Number(u64),
    Text(String),
    Other(IgnoredAny),
}

impl LenientNumber {
    fn or(self, fallback: u64) -> u64 {
        match self {
            LenientNumber::Number(n) => n,
            LenientNumber::Text(text) => text.trim().parse().unwrap_or(fallback),
            LenientNumber::Other(_) => fallback,
        }
    }
}

fn lenient_timeout_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(LenientNumber::deserialize(deserializer)?.or(default_timeout_ms()))
}

/// Garbage disables limiting, same as leaving it unset
fn lenient_request_limit<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let limit = LenientNumber::deserialize(deserializer)?.or(0);
    Ok(u32::try_from(limit).unwrap_or(0))
}

/// Conventional environment variable names and the config keys they land on.
const PLAIN_ENV_KEYS: &[(&str, &str)] = &[
    ("OPENAI_API_KEY", "openai.api_key"),
    ("OPENAI_ACCESS_TOKEN", "openai.access_token"),
    ("OPENAI_API_BASE_URL", "openai.api_base_url"),
    ("OPENAI_API_MODEL", "openai.api_model"),
    ("API_REVERSE_PROXY", "openai.api_reverse_proxy"),
    ("TIMEOUT_MS", "openai.timeout_ms"),
    ("SOCKS_PROXY_HOST", "proxy.socks_host"),
    ("SOCKS_PROXY_PORT", "proxy.socks_port"),
    ("HTTPS_PROXY", "proxy.https_proxy"),
    ("ALL_PROXY", "proxy.all_proxy"),
    ("AUTH_SECRET_KEY", "security.auth_secret_key"),
    ("MAX_REQUEST_PER_HOUR", "security.max_request_per_hour"),
];

fn plain_env_key(key: &UncasedStr) -> Option<Uncased<'_>> {
    PLAIN_ENV_KEYS
        .iter()
        .find(|(name, _)| key == *name)
        .map(|(_, path)| Uncased::from(*path))
}

/// 加载配置文件和环境变量
///
/// ## 功能说明
/// 从 config.toml 和环境变量加载配置，优先级从低到高：
/// 默认值 → 配置文件 → `CHAT_RELAY_` 前缀变量 → 常规变量（如 `OPENAI_API_KEY`）
///
/// ## 错误处理
/// - 配置文件格式错误时返回解析错误
/// - 未提供任何凭据时返回验证错误
pub fn load_config() -> Result<Config> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

/// Same as [`load_config`] but reading the TOML layer from `path`.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config: Config = figment(path)
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration from {} or environment variables",
                path.display()
            )
        })?;

    config.validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

/// The layered configuration sources, exposed so callers can merge overrides.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("CHAT_RELAY_").split("__"))
        .merge(Env::raw().filter_map(plain_env_key))
}

/// Returns the trimmed value when it is present and not blank.
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Config {
    /// 验证整个配置的有效性
    ///
    /// ## 内部实现逻辑
    /// 1. 检查至少提供了 API 密钥或访问令牌之一
    /// 2. 验证 OpenAI 配置（超时时间）
    /// 3. 验证代理配置
    /// 4. 验证日志配置
    pub fn validate(&self) -> Result<()> {
        self.server.validate()
            .context("Server configuration validation failed")?;

        self.openai.validate()
            .context("OpenAI configuration validation failed")?;

        self.proxy.validate()
            .context("Proxy configuration validation failed")?;

        self.logging.validate()
            .context("Logging configuration validation failed")?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        Ok(())
    }
}

impl OpenAIConfig {
    /// 验证 OpenAI 配置
    ///
    /// ## 参数验证规则
    /// - `api_key` / `access_token`: 至少一个非空
    /// - `timeout_ms`: 1 毫秒到 1 小时之间
    /// - `api_base_url` / `api_reverse_proxy`: 如果提供，必须以 http:// 或 https:// 开头
    pub fn validate(&self) -> Result<()> {
        if non_empty(&self.api_key).is_none() && non_empty(&self.access_token).is_none() {
            return Err(anyhow::anyhow!(
                "Missing OPENAI_API_KEY or OPENAI_ACCESS_TOKEN environment variable"
            ));
        }

        if self.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Timeout must be greater than 0"));
        }

        if self.timeout_ms > 60 * 60 * 1000 {
            return Err(anyhow::anyhow!("Timeout cannot exceed 3600000 milliseconds"));
        }

        for (name, url) in [
            ("API base URL", &self.api_base_url),
            ("API reverse proxy", &self.api_reverse_proxy),
        ] {
            if let Some(url) = non_empty(url) {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(anyhow::anyhow!(
                        "{} must start with http:// or https://",
                        name
                    ));
                }
            }
        }

        Ok(())
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.socks_port == Some(0) {
            return Err(anyhow::anyhow!("SOCKS proxy port cannot be 0"));
        }

        Ok(())
    }

    /// HTTPS proxy URL, falling back to the generic all-traffic proxy.
    pub fn https_proxy_url(&self) -> Option<&str> {
        non_empty(&self.https_proxy).or_else(|| non_empty(&self.all_proxy))
    }
}

impl SecurityConfig {
    /// Whether a shared secret gates the protected routes.
    pub fn auth_enabled(&self) -> bool {
        non_empty(&self.auth_secret_key).is_some()
    }
}

impl LoggingConfig {
    /// 验证日志配置参数
    ///
    /// ## 参数验证规则
    /// - `level`: 必须是 "trace", "debug", "info", "warn", "error" 之一
    /// - `format`: 必须是 "json", "pretty", "compact" 之一
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}': must be one of {:?}",
                self.level, valid_levels
            ));
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}': must be one of {:?}",
                self.format, valid_formats
            ));
        }

        Ok(())
    }
}
