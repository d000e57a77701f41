pub mod api_log;
pub mod tokens;

pub use api_log::ApiCallLogger;
pub use tokens::TokenTracker;
