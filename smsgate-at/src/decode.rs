//! Decoding of stored messages in text and PDU mode.
//!
//! Text mode bodies and sender fields may arrive as UCS2 hex when the modem
//! character set is `UCS2`; they are decoded when they look like it.
//! PDU mode handles SMS-DELIVER with 7-bit, 8-bit and UCS2 data coding and
//! extracts the concatenation header when present.

use jiff::{
    Timestamp,
    civil::{Date, DateTime, Time},
    tz::Offset,
};
use serde::{Deserialize, Serialize};
use smsgate_core::SmsPart;
use thiserror::Error;

use crate::{gsm7, responses::fields};

/// Message format selected with `AT+CMGF`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageMode {
    #[default]
    Text,
    Pdu,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("PDU truncated: needed {needed} octets, {available} available")]
    TruncatedPdu { needed: usize, available: usize },
    #[error("unsupported data coding scheme {0:#04x}")]
    UnsupportedCoding(u8),
    #[error("unsupported message type indicator {0}")]
    UnsupportedMessageType(u8),
    #[error("invalid BCD digit {0:#x}")]
    InvalidBcd(u8),
    #[error("invalid hex in PDU")]
    InvalidHex,
    #[error("malformed message header: {0}")]
    MalformedHeader(String),
    #[error("malformed timestamp '{0}'")]
    MalformedTimestamp(String),
}

/// A decoded stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSms {
    pub sender: String,
    /// Service centre timestamp, if the modem reported one.
    pub timestamp: Option<Timestamp>,
    pub body: String,
    pub part: Option<SmsPart>,
}

/// Decode a message from its `+CMGL:`/`+CMGR:` parameters and body line(s).
pub fn decode_sms(
    raw_header: &str,
    raw_body: &str,
    mode: MessageMode,
) -> Result<DecodedSms, DecodeError> {
    match mode {
        MessageMode::Text => decode_text(raw_header, raw_body),
        MessageMode::Pdu => decode_pdu(raw_body),
    }
}

fn decode_text(raw_header: &str, raw_body: &str) -> Result<DecodedSms, DecodeError> {
    let f = fields(raw_header);
    // `+CMGL` carries the index first, `+CMGR` starts at the status.
    let rest = match f.first() {
        Some(first) if !first.quoted && first.value.parse::<u32>().is_ok() => &f[1..],
        _ => &f[..],
    };

    let sender = rest
        .get(1)
        .map(|field| field.value)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DecodeError::MalformedHeader(raw_header.to_owned()))?;
    let sender = decode_ucs2_hex(sender)
        .filter(|decoded| is_dialable(decoded))
        .unwrap_or_else(|| sender.to_owned());

    let timestamp = rest
        .get(3)
        .map(|field| field.value)
        .filter(|v| !v.is_empty())
        .map(parse_text_timestamp)
        .transpose()?;

    let body = raw_body.trim();
    let body = body
        .strip_prefix('"')
        .and_then(|b| b.strip_suffix('"'))
        .unwrap_or(body);
    let body = decode_ucs2_hex(body).unwrap_or_else(|| body.to_owned());

    Ok(DecodedSms {
        sender,
        timestamp,
        body,
        part: None,
    })
}

fn looks_like_ucs2(s: &str) -> bool {
    !s.is_empty() && s.len() % 4 == 0 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decode UCS2 hex, `None` when the input does not look like or is not
/// valid UTF-16.
fn decode_ucs2_hex(s: &str) -> Option<String> {
    if !looks_like_ucs2(s) {
        return None;
    }
    let octets = decode_hex(s).ok()?;
    let units = octets
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

fn is_dialable(s: &str) -> bool {
    let digits = s.strip_prefix('+').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit() || b == b'*' || b == b'#')
}

/// Parse `yy/MM/dd,hh:mm:ss±zz`, the zone in quarter hours.
fn parse_text_timestamp(raw: &str) -> Result<Timestamp, DecodeError> {
    let malformed = || DecodeError::MalformedTimestamp(raw.to_owned());

    let (date, time) = raw.split_once(',').ok_or_else(malformed)?;
    let (time, quarters) = match time.find(['+', '-']) {
        Some(at) => {
            let quarters: i32 = time[at..]
                .trim_start_matches('+')
                .parse()
                .map_err(|_| malformed())?;
            (&time[..at], quarters)
        }
        None => (time, 0),
    };

    let parts = |s: &str, sep: char| -> Option<[i8; 3]> {
        let mut it = s.split(sep).map(|p| p.parse::<i8>().ok());
        let out = [it.next()??, it.next()??, it.next()??];
        it.next().is_none().then_some(out)
    };
    let [yy, month, day] = parts(date, '/').ok_or_else(malformed)?;
    let [hour, minute, second] = parts(time, ':').ok_or_else(malformed)?;

    build_timestamp(
        [yy, month, day, hour, minute, second],
        quarters * 15 * 60,
    )
    .ok_or_else(malformed)
}

fn build_timestamp(fields: [i8; 6], offset_seconds: i32) -> Option<Timestamp> {
    let [yy, month, day, hour, minute, second] = fields;
    let date = Date::new(2000 + i16::from(yy), month, day).ok()?;
    let time = Time::new(hour, minute, second, 0).ok()?;
    let offset = Offset::from_seconds(offset_seconds).ok()?;
    offset.to_timestamp(DateTime::from_parts(date, time)).ok()
}

pub(crate) fn decode_hex(s: &str) -> Result<Vec<u8>, DecodeError> {
    let s = s.trim();
    if s.len() % 2 != 0 || !s.is_ascii() {
        return Err(DecodeError::InvalidHex);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| DecodeError::InvalidHex))
        .collect()
}

struct Cursor<'a> {
    octets: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(octets: &'a [u8]) -> Self {
        Self { octets, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.octets.len() - self.pos;
        if available < n {
            return Err(DecodeError::TruncatedPdu {
                needed: self.pos + n,
                available: self.octets.len(),
            });
        }
        let out = &self.octets[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn rest(&self) -> &'a [u8] {
        &self.octets[self.pos..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
    Gsm7,
    EightBit,
    Ucs2,
}

impl Coding {
    fn from_dcs(dcs: u8) -> Result<Self, DecodeError> {
        let unsupported = Err(DecodeError::UnsupportedCoding(dcs));
        match dcs >> 4 {
            // General data coding, optionally marked for automatic deletion.
            0x0..=0x7 => {
                if dcs & 0x20 != 0 {
                    return unsupported;
                }
                match (dcs >> 2) & 0x03 {
                    0 => Ok(Self::Gsm7),
                    1 => Ok(Self::EightBit),
                    2 => Ok(Self::Ucs2),
                    _ => unsupported,
                }
            }
            // Message waiting indication groups.
            0xC | 0xD => Ok(Self::Gsm7),
            0xE => Ok(Self::Ucs2),
            0xF if dcs & 0x04 == 0 => Ok(Self::Gsm7),
            0xF => Ok(Self::EightBit),
            _ => unsupported,
        }
    }
}

fn decode_pdu(raw: &str) -> Result<DecodedSms, DecodeError> {
    let octets = decode_hex(raw)?;
    let mut cur = Cursor::new(&octets);

    let smsc_len = usize::from(cur.byte()?);
    cur.take(smsc_len)?;

    let first = cur.byte()?;
    let mti = first & 0x03;
    if mti != 0 {
        return Err(DecodeError::UnsupportedMessageType(mti));
    }
    let has_header = first & 0x40 != 0;

    let address_digits = usize::from(cur.byte()?);
    let type_of_address = cur.byte()?;
    let address = cur.take(address_digits.div_ceil(2))?;
    let sender = decode_address(address_digits, type_of_address, address)?;

    let _protocol_id = cur.byte()?;
    let coding = Coding::from_dcs(cur.byte()?)?;
    let timestamp = decode_service_centre_time(cur.take(7)?)?;

    let length = usize::from(cur.byte()?);
    let data = cur.rest();

    let (body, part) = match coding {
        Coding::Gsm7 => {
            let needed = gsm7::packed_len(length);
            let septets = gsm7::unpack(data, length).ok_or(DecodeError::TruncatedPdu {
                needed: cur.pos + needed,
                available: octets.len(),
            })?;
            let (part, skip) = if has_header {
                let header = user_data_header(data)?;
                (concatenation(header), ((header.len() + 1) * 8).div_ceil(7))
            } else {
                (None, 0)
            };
            (gsm7::decode(septets.get(skip..).unwrap_or_default()), part)
        }
        Coding::EightBit | Coding::Ucs2 => {
            if data.len() < length {
                return Err(DecodeError::TruncatedPdu {
                    needed: cur.pos + length,
                    available: octets.len(),
                });
            }
            let data = &data[..length];
            let (part, payload) = if has_header {
                let header = user_data_header(data)?;
                (concatenation(header), &data[header.len() + 1..])
            } else {
                (None, data)
            };
            let body = match coding {
                Coding::Ucs2 => {
                    let units = payload
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
                    char::decode_utf16(units)
                        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                        .collect()
                }
                _ => String::from_utf8_lossy(payload).into_owned(),
            };
            (body, part)
        }
    };

    Ok(DecodedSms {
        sender,
        timestamp: Some(timestamp),
        body,
        part,
    })
}

fn bcd_digit(nibble: u8) -> Result<u8, DecodeError> {
    if nibble > 9 {
        Err(DecodeError::InvalidBcd(nibble))
    } else {
        Ok(nibble)
    }
}

fn decode_address(digits: usize, type_of_address: u8, octets: &[u8]) -> Result<String, DecodeError> {
    let type_of_number = (type_of_address >> 4) & 0x07;

    if type_of_number == 0b101 {
        let count = digits * 4 / 7;
        let septets = gsm7::unpack(octets, count).ok_or(DecodeError::TruncatedPdu {
            needed: gsm7::packed_len(count),
            available: octets.len(),
        })?;
        return Ok(gsm7::decode(&septets));
    }

    let mut number = String::with_capacity(digits + 1);
    if type_of_number == 0b001 {
        number.push('+');
    }
    let nibbles = octets.iter().flat_map(|octet| [octet & 0x0F, octet >> 4]);
    for nibble in nibbles.take(digits) {
        number.push(char::from(b'0' + bcd_digit(nibble)?));
    }
    Ok(number)
}

/// Seven swapped-BCD octets: year, month, day, hour, minute, second, zone.
fn decode_service_centre_time(octets: &[u8]) -> Result<Timestamp, DecodeError> {
    let swapped = |octet: u8| -> Result<i8, DecodeError> {
        Ok((bcd_digit(octet & 0x0F)? * 10 + bcd_digit(octet >> 4)?) as i8)
    };

    let mut fields = [0i8; 6];
    for (slot, octet) in fields.iter_mut().zip(octets) {
        *slot = swapped(*octet)?;
    }

    let zone = octets[6];
    let quarters = i32::from(bcd_digit(zone & 0x07)? * 10 + bcd_digit(zone >> 4)?);
    let quarters = if zone & 0x08 != 0 { -quarters } else { quarters };

    build_timestamp(fields, quarters * 15 * 60).ok_or_else(|| {
        let hex: String = octets.iter().map(|o| format!("{o:02X}")).collect();
        DecodeError::MalformedTimestamp(hex)
    })
}

fn user_data_header(data: &[u8]) -> Result<&[u8], DecodeError> {
    let length = usize::from(*data.first().ok_or(DecodeError::TruncatedPdu {
        needed: 1,
        available: 0,
    })?);
    data.get(1..=length).ok_or(DecodeError::TruncatedPdu {
        needed: length + 1,
        available: data.len(),
    })
}

/// Concatenation info from the 8-bit (IEI 0x00) or 16-bit (IEI 0x08)
/// reference information element.
fn concatenation(header: &[u8]) -> Option<SmsPart> {
    let mut rest = header;
    while let [iei, len, tail @ ..] = rest {
        let len = usize::from(*len);
        let data = tail.get(..len)?;
        match (*iei, data) {
            (0x00, &[reference, total, sequence]) => {
                return Some(SmsPart {
                    reference: u16::from(reference),
                    total,
                    sequence,
                });
            }
            (0x08, &[hi, lo, total, sequence]) => {
                return Some(SmsPart {
                    reference: u16::from_be_bytes([hi, lo]),
                    total,
                    sequence,
                });
            }
            _ => rest = &tail[len..],
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> Option<Timestamp> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn text_mode_list_entry() {
        let sms = decode_sms(
            r#"1,"REC UNREAD","+31641600986",,"25/10/25,19:33:13+44""#,
            "Hello there",
            MessageMode::Text,
        )
        .unwrap();

        assert_eq!(sms.sender, "+31641600986");
        assert_eq!(sms.body, "Hello there");
        assert_eq!(sms.timestamp, utc("2025-10-25T08:33:13Z"));
        assert_eq!(sms.part, None);
    }

    #[test]
    fn text_mode_read_entry_with_ucs2() {
        let sms = decode_sms(
            r#""REC READ","002B00360031003400310032003300340035003600370038",,"25/10/25,19:33:13-08""#,
            "0048006F006C0061",
            MessageMode::Text,
        )
        .unwrap();

        assert_eq!(sms.sender, "+61412345678");
        assert_eq!(sms.body, "Hola");
        assert_eq!(sms.timestamp, utc("2025-10-25T21:33:13Z"));
    }

    #[test]
    fn text_mode_hex_detection() {
        let sms = decode_sms(r#""REC READ","+111",,"#, "CAFE", MessageMode::Text).unwrap();
        // Four hex digits always read as UCS2.
        assert_eq!(sms.body, "\u{CAFE}");
        assert_eq!(sms.timestamp, None);

        let sms = decode_sms(r#""REC READ","+111",,"#, "BEEF1", MessageMode::Text).unwrap();
        assert_eq!(sms.body, "BEEF1");
    }

    #[test]
    fn text_mode_missing_sender() {
        assert!(matches!(
            decode_sms(r#"1,"REC READ""#, "x", MessageMode::Text),
            Err(DecodeError::MalformedHeader(_))
        ));
    }

    #[test]
    fn text_mode_bad_timestamp() {
        assert!(matches!(
            decode_sms(r#""REC READ","+111",,"25/13/45,99:00:00+00""#, "x", MessageMode::Text),
            Err(DecodeError::MalformedTimestamp(_))
        ));
    }

    #[test]
    fn pdu_seven_bit() {
        let sms = decode_sms(
            "4,1,,23",
            "0004 0B911346610089F6 00 00 52015291333100 0C C8F71D14969741F977FD07"
                .replace(' ', "")
                .as_str(),
            MessageMode::Pdu,
        )
        .unwrap();

        assert_eq!(sms.sender, "+31641600986");
        assert_eq!(sms.body, "How are you?");
        assert_eq!(sms.timestamp, utc("2025-10-25T19:33:13Z"));
    }

    #[test]
    fn pdu_ucs2() {
        let sms = decode_sms(
            "",
            "00040B911614325476F8000852015291333100080048006F006C0061",
            MessageMode::Pdu,
        )
        .unwrap();

        assert_eq!(sms.sender, "+61412345678");
        assert_eq!(sms.body, "Hola");
    }

    #[test]
    fn pdu_alphanumeric_sender() {
        let sms = decode_sms(
            "",
            "00040BD0C7F7FBCC2E030000520152913331000AD4F29C0E",
            MessageMode::Pdu,
        );
        // UDL claims 10 septets but only 4 octets follow.
        assert!(matches!(sms, Err(DecodeError::TruncatedPdu { .. })));

        let sms = decode_sms(
            "",
            "00040BD0C7F7FBCC2E0300005201529133310004D4F29C0E",
            MessageMode::Pdu,
        )
        .unwrap();
        assert_eq!(sms.sender, "Google");
        assert_eq!(sms.body, "Test");
    }

    #[test]
    fn pdu_concatenated_seven_bit() {
        let sms = decode_sms(
            "",
            "00440B911346610089F6000052015291333100 09 050003CC02019069".replace(' ', "").as_str(),
            MessageMode::Pdu,
        )
        .unwrap();

        assert_eq!(sms.body, "Hi");
        assert_eq!(
            sms.part,
            Some(SmsPart {
                reference: 0xCC,
                total: 2,
                sequence: 1
            })
        );
    }

    #[test]
    fn pdu_timezone_sign() {
        // Zone octet 0x8A: tens 2 (0x0A & 0x07), units 8, negative -> -28 quarters (-7h).
        let sms = decode_sms(
            "",
            "00040B911346610089F600005201529133318A04D4F29C0E",
            MessageMode::Pdu,
        )
        .unwrap();
        assert_eq!(sms.timestamp, utc("2025-10-26T02:33:13Z"));
    }

    #[test]
    fn pdu_errors() {
        assert_eq!(decode_sms("", "0G", MessageMode::Pdu), Err(DecodeError::InvalidHex));
        assert!(matches!(
            decode_sms("", "00040B91", MessageMode::Pdu),
            Err(DecodeError::TruncatedPdu { .. })
        ));
        assert_eq!(
            decode_sms(
                "",
                "00040B911346610089F6002C520152913331000100",
                MessageMode::Pdu
            ),
            Err(DecodeError::UnsupportedCoding(0x2C))
        );
        assert_eq!(
            decode_sms("", "00040B911346610A89F6", MessageMode::Pdu),
            Err(DecodeError::InvalidBcd(0xA))
        );
        assert_eq!(
            decode_sms("", "0001000B911346610089F6", MessageMode::Pdu),
            Err(DecodeError::UnsupportedMessageType(1))
        );
    }

    #[test]
    fn data_coding_groups() {
        assert_eq!(Coding::from_dcs(0x00), Ok(Coding::Gsm7));
        assert_eq!(Coding::from_dcs(0x08), Ok(Coding::Ucs2));
        assert_eq!(Coding::from_dcs(0x04), Ok(Coding::EightBit));
        assert_eq!(Coding::from_dcs(0x48), Ok(Coding::Ucs2));
        assert_eq!(Coding::from_dcs(0xE0), Ok(Coding::Ucs2));
        assert_eq!(Coding::from_dcs(0xF0), Ok(Coding::Gsm7));
        assert_eq!(Coding::from_dcs(0xF4), Ok(Coding::EightBit));
        assert_eq!(Coding::from_dcs(0x0C), Err(DecodeError::UnsupportedCoding(0x0C)));
        assert_eq!(Coding::from_dcs(0x90), Err(DecodeError::UnsupportedCoding(0x90)));
    }
}
