use async_trait::async_trait;
use smsgate_core::Event;
use tracing::info;

use super::{EventSink, SinkError};

/// Writes events to the log. Used when no remote sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &Event) -> Result<(), SinkError> {
        match event {
            Event::Call(call) => info!(
                device = %call.device,
                caller = %call.caller_number,
                call_type = call.call_type.as_str(),
                "incoming call"
            ),
            Event::Sms(sms) => info!(
                device = %sms.device,
                sender = %sms.sender_number,
                index = sms.raw_index,
                body = %sms.body,
                "incoming sms"
            ),
        }
        Ok(())
    }

    async fn announce(&self, text: &str) -> Result<(), SinkError> {
        info!(text, "announcement");
        Ok(())
    }
}
