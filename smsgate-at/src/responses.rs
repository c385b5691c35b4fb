//! Parsers for information lines of the commands the gateway issues.

use serde::Serialize;
use smsgate_core::{CallDirection, CallType};
use tracing::debug;

use crate::AtResponse;

/// One comma separated parameter of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Field<'a> {
    pub value: &'a str,
    pub quoted: bool,
}

/// Split parameters on commas outside double quotes, stripping the quotes.
pub(crate) fn fields(input: &str) -> Vec<Field<'_>> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(field(&input[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(field(&input[start..]));
    out
}

fn field(raw: &str) -> Field<'_> {
    let raw = raw.trim();
    match raw
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
    {
        Some(inner) => Field {
            value: inner,
            quoted: true,
        },
        None => Field {
            value: raw,
            quoted: false,
        },
    }
}

fn number<T: std::str::FromStr>(field: Option<&Field<'_>>) -> Option<T> {
    field.and_then(|f| f.value.parse().ok())
}

/// Number with a `+` prefix restored when the type-of-address says it is
/// international.
fn dialable(raw: &str, type_of_address: Option<u8>) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    if type_of_address == Some(145) && !raw.starts_with('+') {
        Some(format!("+{raw}"))
    } else {
        Some(raw.to_owned())
    }
}

/// `<stat>` of a `+CLCC` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallStatus {
    Active,
    Held,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
    Unknown,
}

impl CallStatus {
    pub fn from_clcc(stat: u8) -> Self {
        match stat {
            0 => Self::Active,
            1 => Self::Held,
            2 => Self::Dialing,
            3 => Self::Alerting,
            4 => Self::Incoming,
            5 => Self::Waiting,
            _ => Self::Unknown,
        }
    }
}

/// One call from the current-calls list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub id: u8,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub call_type: CallType,
    pub multiparty: bool,
    pub number: Option<String>,
}

impl CallInfo {
    /// Parse the parameters of a `+CLCC:` line.
    pub fn parse(params: &str) -> Option<Self> {
        let f = fields(params);
        Some(Self {
            id: number(f.first())?,
            direction: CallDirection::from_clcc(number(f.get(1))?)?,
            status: CallStatus::from_clcc(number(f.get(2))?),
            call_type: CallType::from_clcc(number(f.get(3))?),
            multiparty: number::<u8>(f.get(4))? == 1,
            number: f
                .get(5)
                .and_then(|n| dialable(n.value, number(f.get(6)))),
        })
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == CallDirection::Incoming
    }
}

/// Parse an `AT+CLCC` response. An empty list means no call is in progress.
pub fn parse_call_list(response: &AtResponse) -> Vec<CallInfo> {
    response
        .lines()
        .iter()
        .filter_map(|line| line.strip_prefix("+CLCC:"))
        .filter_map(|params| {
            let info = CallInfo::parse(params);
            if info.is_none() {
                debug!(params, "ignoring malformed +CLCC line");
            }
            info
        })
        .collect()
}

/// The number reported by a `+CLIP:` line, if the network provided one.
pub fn parse_caller_id(params: &str) -> Option<String> {
    let f = fields(params);
    let raw = f.first()?;
    dialable(raw.value, number(f.get(1)))
}

/// A message as listed or read from the modem store, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub index: u32,
    /// Parameters of the `+CMGL:`/`+CMGR:` line, without the prefix.
    pub header: String,
    /// Following lines up to the next header, joined with `\n`.
    pub body: String,
}

/// Parse an `AT+CMGL` response into its messages.
pub fn parse_message_list(response: &AtResponse) -> Vec<StoredMessage> {
    let mut messages: Vec<StoredMessage> = Vec::new();
    let mut current: Option<StoredMessage> = None;

    for line in response.lines() {
        if let Some(params) = line.strip_prefix("+CMGL:") {
            messages.extend(current.take());
            let params = params.trim_start();
            match number(fields(params).first()) {
                Some(index) => {
                    current = Some(StoredMessage {
                        index,
                        header: params.to_owned(),
                        body: String::new(),
                    })
                }
                None => debug!(params, "ignoring +CMGL line without index"),
            }
        } else if let Some(message) = current.as_mut() {
            if !message.body.is_empty() {
                message.body.push('\n');
            }
            message.body.push_str(line);
        }
    }
    messages.extend(current);
    messages
}

/// Parse an `AT+CMGR=<index>` response. `None` when the slot is empty.
pub fn parse_read_message(index: u32, response: &AtResponse) -> Option<StoredMessage> {
    let mut lines = response.lines().iter();
    let header = lines.by_ref().find_map(|line| line.strip_prefix("+CMGR:"))?;
    let body = lines.map(String::as_str).collect::<Vec<_>>().join("\n");

    Some(StoredMessage {
        index,
        header: header.trim_start().to_owned(),
        body,
    })
}

/// `+CSQ` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalQuality {
    pub rssi: u8,
    pub ber: u8,
}

impl SignalQuality {
    /// RSSI scaled to 0..=100, `None` when the modem reports 99 (unknown).
    pub fn percent(&self) -> Option<u8> {
        if self.rssi == 99 {
            return None;
        }
        Some((u32::from(self.rssi.min(31)) * 100 / 31) as u8)
    }
}

pub fn parse_signal_quality(response: &AtResponse) -> Option<SignalQuality> {
    let f = fields(response.find("+CSQ:")?);
    Some(SignalQuality {
        rssi: number(f.first())?,
        ber: number(f.get(1)).unwrap_or(99),
    })
}

/// Usage of the first message storage reported by `+CPMS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    /// Storage name; empty when the modem answered a set command, which
    /// omits names.
    pub storage: String,
    pub used: u32,
    pub total: u32,
}

pub fn parse_storage_status(response: &AtResponse) -> Option<StorageUsage> {
    let f = fields(response.find("+CPMS:")?);
    let first = f.first()?;
    let (storage, rest) = if first.quoted {
        (first.value.to_owned(), &f[1..])
    } else {
        (String::new(), &f[..])
    };

    Some(StorageUsage {
        storage,
        used: number(rest.first())?,
        total: number(rest.get(1))?,
    })
}

/// Network registration reported by `+CREG`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub stat: u8,
    pub location_area: Option<String>,
    pub cell_id: Option<String>,
    pub access_technology: Option<u8>,
}

impl Registration {
    pub fn status(&self) -> &'static str {
        match self.stat {
            0 => "Not registered",
            1 => "Registered (home)",
            2 => "Searching",
            3 => "Registration denied",
            5 => "Registered (roaming)",
            6 => "Registered (home, SMS only)",
            7 => "Registered (roaming, SMS only)",
            8 => "Emergency services only",
            _ => "Unknown",
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.stat, 1 | 5 | 6 | 7)
    }

    pub fn technology(&self) -> Option<&'static str> {
        Some(match self.access_technology? {
            0 => "GSM",
            1 => "GSM Compact",
            2 => "UTRAN",
            3 => "GSM w/EGPRS",
            4 => "UTRAN w/HSDPA",
            5 => "UTRAN w/HSUPA",
            6 => "UTRAN w/HSDPA and HSUPA",
            7 => "E-UTRAN",
            _ => "Unknown",
        })
    }
}

/// Parse `+CREG: <n>,<stat>[,<lac>,<ci>[,<act>]]`.
pub fn parse_registration(response: &AtResponse) -> Option<Registration> {
    let f = fields(response.find("+CREG:")?);
    let text = |i: usize| {
        f.get(i)
            .filter(|field| !field.value.is_empty())
            .map(|field| field.value.to_owned())
    };

    Some(Registration {
        stat: number(f.get(1))?,
        location_area: text(2),
        cell_id: text(3),
        access_technology: number(f.get(4)),
    })
}
