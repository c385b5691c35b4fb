use crate::responses::{fields, parse_caller_id};

/// Prefixes of result codes a modem may emit at any time, including in the
/// middle of another command's response.
const UNSOLICITED_PREFIXES: &[&str] = &[
    "+CRING:",
    "+CLIP:",
    "+CMTI:",
    "+CDSI:",
    "NO CARRIER",
    "BUSY",
    "NO ANSWER",
];

/// Interpretation of an unsolicited line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrcKind {
    Ring,
    /// `+CLIP`; `None` when the network withheld the number.
    CallerId(Option<String>),
    /// `+CMTI`: a message was stored at `index` in `storage`.
    NewMessage { storage: String, index: u32 },
    /// `NO CARRIER`, `BUSY` or `NO ANSWER`.
    CallEnded,
    Other,
}

/// A line that arrived outside a command response window, or a known
/// unsolicited result code that interleaved one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsolicitedLine(String);

impl UnsolicitedLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn text(&self) -> &str {
        &self.0
    }

    pub fn into_text(self) -> String {
        self.0
    }

    /// Whether this is a recognised unsolicited result code rather than an
    /// information line of some command.
    pub fn is_known(&self) -> bool {
        self.0 == "RING"
            || UNSOLICITED_PREFIXES
                .iter()
                .any(|prefix| self.0.starts_with(prefix))
    }

    pub fn kind(&self) -> UrcKind {
        let line = self.0.as_str();

        if line == "RING" || line.starts_with("+CRING:") {
            return UrcKind::Ring;
        }
        if let Some(params) = line.strip_prefix("+CLIP:") {
            return UrcKind::CallerId(parse_caller_id(params));
        }
        if let Some(params) = line.strip_prefix("+CMTI:") {
            let f = fields(params);
            return match (f.first(), f.get(1).and_then(|i| i.value.parse().ok())) {
                (Some(storage), Some(index)) => UrcKind::NewMessage {
                    storage: storage.value.to_owned(),
                    index,
                },
                _ => UrcKind::Other,
            };
        }
        if line.starts_with("NO CARRIER") || line.starts_with("BUSY") || line.starts_with("NO ANSWER")
        {
            return UrcKind::CallEnded;
        }
        UrcKind::Other
    }
}
