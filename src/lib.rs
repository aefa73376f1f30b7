pub mod config;
pub mod envelope;
pub mod errors;
pub mod middleware;
pub mod providers;
pub mod proxy;
pub mod relay;
pub mod reporter;
pub mod server;
pub mod translator;

// Re-export commonly used types for easier access
pub use config::{Config, load_config, load_config_from};
pub use errors::{AppError, AppResult};
pub use relay::{ChatRelay, RelayOutcome, RelayRequest};
pub use server::{AppState, create_app, start_server};
