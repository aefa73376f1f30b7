pub mod model;
pub mod provider;

pub use model::TokenBudget;
pub use provider::{ChatGptApi, DirectSendOptions, parent_message_id_from};
