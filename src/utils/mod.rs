pub mod progress;
pub mod retry;

pub use progress::{format_bytes, format_duration, format_progress, format_speed};
pub use retry::{classify, item_error, RetryBudgets, RetryDecision, RetryPolicy};
