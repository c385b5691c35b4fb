pub mod log;
pub mod telegram;

use async_trait::async_trait;
use smsgate_core::Event;
use thiserror::Error;

pub use log::LogSink;
pub use telegram::TelegramSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("event sink closed")]
    Closed,
}

/// Destination for forwarded events.
///
/// Called from a single dispatcher task, in arrival order across devices.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn publish(&self, event: &Event) -> Result<(), SinkError>;

    /// Free-form operational notice such as start-up or shutdown.
    async fn announce(&self, _text: &str) -> Result<(), SinkError> {
        Ok(())
    }
}
