use std::path::PathBuf;

use chat_relay::{AppError, AppState, config::{DEFAULT_CONFIG_FILE, LoggingConfig}, load_config_from, start_server};
use clap::Parser;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Streaming chat relay in front of OpenAI or a ChatGPT reverse proxy
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

/// 主函数 - 中继服务的入口点
///
/// 加载配置、初始化日志、在监听端口之前完成后端模式选择，然后启动 HTTP 服务器
#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    // 加载配置文件和环境变量配置；缺少凭据时在此处失败，进程不会开始监听
    let mut config = load_config_from(&cli.config)
        .map_err(|e| AppError::ConfigError(format!("加载配置失败: {:#}", e)))?;

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config.logging)?;

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        timeout_ms = config.openai.timeout_ms,
        auth = config.security.auth_enabled(),
        "Configuration loaded successfully"
    );

    // 后端模式与出站代理在这里一次性确定
    let state = AppState::new(config)?;

    tracing::info!(mode = state.relay.mode().as_str(), "Backend initialized");

    start_server(state).await?;

    Ok(())
}

/// 初始化结构化日志系统
///
/// `RUST_LOG` 优先；否则使用配置中的日志级别。支持 json / pretty / compact 三种格式
fn init_tracing(logging: &LoggingConfig) -> Result<(), AppError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chat_relay={},tower_http=debug", logging.level)));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match logging.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).try_init(),
        "compact" => registry.with(fmt::layer().compact().with_target(false)).try_init(),
        _ => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .json(),
            )
            .try_init(),
    };

    result.map_err(|e| AppError::ConfigError(format!("Failed to initialize tracing: {}", e)))?;

    tracing::info!(format = %logging.format, "Structured logging system initialized");
    Ok(())
}
