pub mod model;
pub mod provider;

pub use provider::{ReverseSendOptions, UnofficialProxyApi, reverse_context_from};
