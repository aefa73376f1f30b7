use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, header},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::{Config, non_empty},
    envelope::ApiResponse,
    errors::{AppError, AppResult},
    middleware::{RateLimiter, auth_middleware, rate_limit_middleware, request_id_middleware},
    providers::{ProviderClient, model::ChatMessage},
    proxy::ProxySelector,
    relay::{ChatRelay, RelayOutcome, RelayRequest},
    reporter::{ChatConfigReport, ConfigReporter},
};

/// 应用程序状态 - 在所有请求处理器之间共享
///
/// 除限流计数器外全部只读，后端模式和 HTTP 客户端在启动时一次性确定
#[derive(Clone)]
pub struct AppState {
    /// 应用程序配置（只读共享）
    pub config: Arc<Config>,
    /// 聊天中继
    pub relay: Arc<ChatRelay>,
    /// 配置与余额报告
    pub reporter: Arc<ConfigReporter>,
    /// 按客户端计数的限流器
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Resolve the proxy, select the backend mode and build shared state.
    ///
    /// Runs to completion before the listener binds, so no request can observe
    /// a half-initialized backend.
    pub fn new(config: Config) -> AppResult<Self> {
        let proxy = ProxySelector::from_config(&config.proxy);
        let http_client = proxy.build_client()?;

        let provider = Arc::new(ProviderClient::from_config(&config.openai, http_client)?);
        let relay = Arc::new(ChatRelay::new(provider.clone()));
        let reporter = Arc::new(ConfigReporter::new(provider, proxy, &config.openai));
        let rate_limiter = Arc::new(RateLimiter::hourly(config.security.max_request_per_hour));

        Ok(Self {
            config: Arc::new(config),
            relay,
            reporter,
            rate_limiter,
        })
    }
}

/// Create the application router; routes are served at the root and under `/api`
pub fn create_app(state: AppState) -> Router {
    let chat = Router::new()
        .route("/chat-process", post(chat_process_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let config = Router::new()
        .route("/config", post(config_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let open = Router::new()
        .route("/session", post(session_handler))
        .route("/verify", post(verify_handler));

    let api = Router::new().merge(chat).merge(config).merge(open);

    let cors_enabled = state.config.security.cors_enabled;

    let app = Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_id_middleware)),
        );

    if cors_enabled { app.layer(cors_layer()) } else { app }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_methods(Any)
}

/// Start the HTTP server with already-initialized state
pub async fn start_server(state: AppState) -> AppResult<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = create_app(state);

    let listener = TcpListener::bind(&addr).await
        .map_err(|e| AppError::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    tracing::info!("Chat relay server starting on {}", addr);
    tracing::info!("Available endpoints (also under /api):");
    tracing::info!("  POST /chat-process - Streamed chat completion");
    tracing::info!("  POST /config - Configuration and balance summary");
    tracing::info!("  POST /session - Session probe");
    tracing::info!("  POST /verify - Secret key verification");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| AppError::internal(format!("Server error: {}", e)))?;

    Ok(())
}

// Request Handlers

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatProcessRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: Option<Value>,
    #[serde(default)]
    pub system_message: Option<String>,
}

/// Writes self-delimited JSON blocks: the first bare, later ones after a newline
struct ChunkWriter {
    tx: UnboundedSender<String>,
    first: bool,
}

impl ChunkWriter {
    fn new(tx: UnboundedSender<String>) -> Self {
        Self { tx, first: true }
    }

    fn write<T: Serialize>(&mut self, value: &T) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize stream block");
                return;
            }
        };

        let block = if self.first { json } else { format!("\n{}", json) };
        self.first = false;

        // Receiver is gone when the client disconnected; the relay still runs to completion.
        if self.tx.send(block).is_err() {
            tracing::debug!("Client disconnected before stream block was written");
        }
    }
}

/// Handle streamed chat requests
async fn chat_process_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatProcessRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return rejected_body(rejection).into_response(),
    };

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let relay = state.relay.clone();

    let request = RelayRequest {
        message: body.prompt,
        prior_context: body.options,
        system_message: body.system_message,
    };

    tokio::spawn(async move {
        let mut writer = ChunkWriter::new(tx);
        let outcome = relay
            .relay(request, &mut |chunk: &ChatMessage| writer.write(chunk))
            .await;

        if let RelayOutcome::Failure { message, .. } = outcome {
            writer.write(&ApiResponse::<()>::fail(message));
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);

    (
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Handle configuration summary requests
async fn config_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<ChatConfigReport>> {
    Json(ApiResponse::success(state.reporter.report().await))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub auth: bool,
    pub model: String,
}

/// Tell the client whether a secret is required and which backend is active
async fn session_handler(
    State(state): State<AppState>,
) -> Json<ApiResponse<SessionInfo>> {
    let info = SessionInfo {
        auth: state.config.security.auth_enabled(),
        model: state.relay.mode().as_str().to_string(),
    };
    Json(ApiResponse::success_with_message("", Some(info)))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: Option<String>,
}

/// Check a secret key submitted by the client
async fn verify_handler(
    State(state): State<AppState>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> AppResult<Json<ApiResponse<()>>> {
    let Json(body) = payload.map_err(rejected_body)?;
    let token = non_empty(&body.token)
        .ok_or_else(|| AppError::bad_request("Secret key is empty"))?;

    if non_empty(&state.config.security.auth_secret_key) != Some(token) {
        return Err(AppError::bad_request("密钥无效 | Secret key is invalid"));
    }

    Ok(Json(ApiResponse::success_with_message("Verify successfully", None)))
}

/// Body extraction failures answer with the envelope instead of axum's plain text
fn rejected_body(rejection: JsonRejection) -> AppError {
    tracing::warn!(status = rejection.status().as_u16(), error = %rejection.body_text(), "Rejected request body");
    AppError::bad_request(rejection.body_text())
}
