use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{Instrument, info, warn};
use uuid::Uuid;

use crate::{
    config::non_empty,
    errors::AppError,
    server::AppState,
};

/// Request ID header name
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub const NO_ACCESS_MESSAGE: &str = "Error: 无访问权限 | No access rights";
pub const RATE_LIMITED_MESSAGE: &str = "Too many request from this IP in 1 hour";

/// Windows kept before stale entries are swept
const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Attach a request ID and log the request inside its span
pub async fn request_id_middleware(
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    let method = request.method().to_string();
    let uri = request.uri().to_string();
    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    let start = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;

    span.in_scope(|| {
        info!(
            status = %response.status().as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Request completed"
        );
    });

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Gatekeep protected routes with the shared secret, when one is configured
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(secret) = non_empty(&state.config.security.auth_secret_key) {
        let provided = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.replace("Bearer ", "").trim().to_string());

        if provided.as_deref() != Some(secret) {
            warn!(uri = %request.uri(), "Rejected request with missing or invalid secret");
            return Err(AppError::AuthenticationError(NO_ACCESS_MESSAGE.to_string()));
        }
    }

    Ok(next.run(request).await)
}

/// Cap chat requests per client per hour
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if state.rate_limiter.is_enabled() {
        let client = client_key(&request);
        if !state.rate_limiter.check(&client).await {
            warn!(client = %client, "Rate limit exceeded");
            return Err(AppError::RateLimitError(RATE_LIMITED_MESSAGE.to_string()));
        }
    }

    Ok(next.run(request).await)
}

/// Identify the caller: the hop appended by the one trusted proxy, then the peer address
fn client_key(request: &Request) -> String {
    forwarded_for(request.headers())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        // earlier entries are whatever the client sent and can be forged
        .and_then(|v| v.split(',').next_back())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy)]
struct ClientWindow {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Fixed-window request counter keyed by client
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: TimeDelta,
    clients: Mutex<HashMap<String, ClientWindow>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: TimeDelta) -> Self {
        Self {
            max_requests,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// `max_requests == 0` disables limiting
    pub fn hourly(max_requests: u32) -> Self {
        Self::new(max_requests, TimeDelta::hours(1))
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0
    }

    pub async fn check(&self, client: &str) -> bool {
        self.check_at(client, Utc::now()).await
    }

    /// Count one request at `now`; `false` once the client's window is full
    pub async fn check_at(&self, client: &str, now: DateTime<Utc>) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let mut clients = self.clients.lock().await;

        if clients.len() >= MAX_TRACKED_CLIENTS && !clients.contains_key(client) {
            let window = self.window;
            clients.retain(|_, w| now - w.started_at < window);

            // still full of live windows: drop the oldest to stay bounded
            if clients.len() >= MAX_TRACKED_CLIENTS {
                let oldest = clients
                    .iter()
                    .min_by_key(|(_, w)| w.started_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    clients.remove(&oldest);
                }
            }
        }

        let entry = clients.entry(client.to_string()).or_insert(ClientWindow {
            started_at: now,
            count: 0,
        });

        if now - entry.started_at >= self.window {
            *entry = ClientWindow {
                started_at: now,
                count: 0,
            };
        }

        if entry.count >= self.max_requests {
            return false;
        }

        entry.count += 1;
        true
    }
}
