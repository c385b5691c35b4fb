use serde::{Deserialize, Serialize};
use ulid::Ulid;

// Events are immutable point-in-time facts, so their text fields use
// `Box<str>` instead of `String` to keep them compact.
type BoxStr = Box<str>;

/// Caller number reported when the network withholds the caller identity
/// or the modem could not be asked for it.
pub const UNKNOWN_CALLER: &str = "unknown";

/// Unique identifier for a forwarded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Ulid);

impl EventId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Direction of a voice call relative to the monitored modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    /// Mobile terminated.
    Incoming,
    /// Mobile originated.
    Outgoing,
}

impl CallDirection {
    /// Map the `<dir>` field of a `+CLCC` line.
    pub fn from_clcc(dir: u8) -> Option<Self> {
        match dir {
            0 => Some(Self::Outgoing),
            1 => Some(Self::Incoming),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "Incoming",
            Self::Outgoing => "Outgoing",
        }
    }
}

/// Bearer type of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallType {
    Voice,
    Data,
    Fax,
    Unknown,
}

impl CallType {
    /// Map the `<mode>` field of a `+CLCC` line.
    pub fn from_clcc(mode: u8) -> Self {
        match mode {
            0 => Self::Voice,
            1 => Self::Data,
            2 => Self::Fax,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "Voice",
            Self::Data => "Data",
            Self::Fax => "Fax",
            Self::Unknown => "Unknown",
        }
    }
}

/// A notification that a call rang on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    /// Unique id for this event.
    pub id: EventId,
    /// Name of the device that saw the call.
    pub device: BoxStr,
    /// Caller number, or [`UNKNOWN_CALLER`].
    pub caller_number: BoxStr,
    pub direction: CallDirection,
    pub call_type: CallType,
    /// When the call was detected.
    pub timestamp: jiff::Timestamp,
}

impl CallEvent {
    /// Whether the caller identity was unavailable.
    pub fn caller_withheld(&self) -> bool {
        &*self.caller_number == UNKNOWN_CALLER
    }
}

/// Position of a message inside a concatenated SMS.
///
/// Parts are forwarded individually; this only tells the receiver how
/// they relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SmsPart {
    /// Concatenation reference shared by all parts of one message.
    pub reference: u16,
    /// Total number of parts.
    pub total: u8,
    /// 1-based sequence number of this part.
    pub sequence: u8,
}

/// A received SMS read from a modem's message store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsEvent {
    /// Unique id for this event.
    pub id: EventId,
    /// Name of the device whose store held the message.
    pub device: BoxStr,
    pub sender_number: BoxStr,
    /// Service centre timestamp, or the time the message was read when the
    /// modem did not report one.
    pub timestamp: jiff::Timestamp,
    pub body: BoxStr,
    /// Modem message-store index the message was read from.
    pub raw_index: u32,
    /// Concatenation info when the message is one part of a longer SMS.
    pub part: Option<SmsPart>,
}

/// Everything the gateway forwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Call(CallEvent),
    Sms(SmsEvent),
}

/// Discriminant of [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Call,
    Sms,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Sms => "sms",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "call" => Ok(Self::Call),
            "sms" => Ok(Self::Sms),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

impl Event {
    pub fn id(&self) -> EventId {
        match self {
            Event::Call(call) => call.id,
            Event::Sms(sms) => sms.id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Call(_) => EventKind::Call,
            Event::Sms(_) => EventKind::Sms,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            Event::Call(call) => &call.device,
            Event::Sms(sms) => &sms.device,
        }
    }

    /// The counterpart's number: caller for calls, sender for messages.
    pub fn number(&self) -> &str {
        match self {
            Event::Call(call) => &call.caller_number,
            Event::Sms(sms) => &sms.sender_number,
        }
    }

    pub fn timestamp(&self) -> jiff::Timestamp {
        match self {
            Event::Call(call) => call.timestamp,
            Event::Sms(sms) => sms.timestamp,
        }
    }
}

/// Connection status of a monitored device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected, waiting to (re)open the transport.
    Disconnected,
    /// Transport open, modem being initialised.
    Connecting,
    /// Monitoring loops running.
    Ready,
    /// The transport failed; the supervisor will reconnect.
    Faulted,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(number: &str) -> CallEvent {
        CallEvent {
            id: EventId::new(),
            device: "modem-a".into(),
            caller_number: number.into(),
            direction: CallDirection::Incoming,
            call_type: CallType::Voice,
            timestamp: jiff::Timestamp::UNIX_EPOCH,
        }
    }

    #[test]
    fn clcc_fields_map_to_enums() {
        assert_eq!(CallDirection::from_clcc(1), Some(CallDirection::Incoming));
        assert_eq!(CallDirection::from_clcc(0), Some(CallDirection::Outgoing));
        assert_eq!(CallDirection::from_clcc(7), None);
        assert_eq!(CallType::from_clcc(0), CallType::Voice);
        assert_eq!(CallType::from_clcc(9), CallType::Unknown);
    }

    #[test]
    fn withheld_caller_is_reported_literally() {
        assert!(call(UNKNOWN_CALLER).caller_withheld());
        assert!(!call("+61412345678").caller_withheld());
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let event = Event::Call(call("+61412345678"));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "call");
        assert_eq!(json["caller_number"], "+61412345678");
        assert_eq!(event.kind(), EventKind::Call);
        assert_eq!(event.number(), "+61412345678");
    }

    #[test]
    fn event_kind_parses_case_insensitively() {
        assert_eq!("SMS".parse::<EventKind>(), Ok(EventKind::Sms));
        assert!("fax".parse::<EventKind>().is_err());
    }
}
