use std::time::Duration;

use crate::MessageMode;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Final result line that closes a command's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Ok,
    /// `ERROR`, `+CME ERROR: ..` or `+CMS ERROR: ..`, kept verbatim.
    Error(String),
}

impl Terminator {
    pub fn parse(line: &str) -> Option<Self> {
        if line == "OK" {
            Some(Self::Ok)
        } else if line == "ERROR"
            || line.starts_with("+CME ERROR:")
            || line.starts_with("+CMS ERROR:")
        {
            Some(Self::Error(line.to_owned()))
        } else {
            None
        }
    }
}

/// A single AT command line, written to the modem followed by `\r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtCommand {
    text: String,
    timeout: Duration,
    payload_header: Option<&'static str>,
}

impl AtCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timeout: DEFAULT_TIMEOUT,
            payload_header: None,
        }
    }

    /// The line after each information line starting with `prefix` is
    /// payload, taken verbatim even when it reads like a result code.
    pub fn with_payload_after(mut self, prefix: &'static str) -> Self {
        self.payload_header = Some(prefix);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn payload_header(&self) -> Option<&'static str> {
        self.payload_header
    }

    pub fn probe() -> Self {
        Self::new("AT")
    }

    pub fn echo_off() -> Self {
        Self::new("ATE0")
    }

    pub fn message_format(mode: MessageMode) -> Self {
        match mode {
            MessageMode::Text => Self::new("AT+CMGF=1"),
            MessageMode::Pdu => Self::new("AT+CMGF=0"),
        }
    }

    pub fn character_set(charset: &str) -> Self {
        Self::new(format!("AT+CSCS=\"{charset}\""))
    }

    /// Use `storage` for reading, writing and receiving messages.
    pub fn preferred_storage(storage: &str) -> Self {
        Self::new(format!(
            "AT+CPMS=\"{storage}\",\"{storage}\",\"{storage}\""
        ))
    }

    pub fn storage_status() -> Self {
        Self::new("AT+CPMS?")
    }

    pub fn caller_id(enable: bool) -> Self {
        Self::new(format!("AT+CLIP={}", u8::from(enable)))
    }

    pub fn list_calls() -> Self {
        Self::new("AT+CLCC")
    }

    /// List every stored message, read or not.
    pub fn list_messages(mode: MessageMode) -> Self {
        let command = match mode {
            MessageMode::Text => Self::new("AT+CMGL=\"ALL\""),
            MessageMode::Pdu => Self::new("AT+CMGL=4"),
        };
        command.with_payload_after("+CMGL:")
    }

    pub fn read_message(index: u32) -> Self {
        Self::new(format!("AT+CMGR={index}")).with_payload_after("+CMGR:")
    }

    pub fn delete_message(index: u32) -> Self {
        Self::new(format!("AT+CMGD={index}"))
    }

    pub fn signal_quality() -> Self {
        Self::new("AT+CSQ")
    }

    pub fn registration() -> Self {
        Self::new("AT+CREG?")
    }
}

/// Information lines a modem returned before its `OK`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtResponse {
    lines: Vec<String>,
}

impl AtResponse {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The remainder of the first line starting with `prefix`.
    pub fn find(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|line| line.strip_prefix(prefix))
            .map(str::trim_start)
    }
}
