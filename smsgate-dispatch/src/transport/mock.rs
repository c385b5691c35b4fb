use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use smsgate_at::MessageMode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const STORE_CAPACITY: usize = 50;
const SIMULATED_SENDER: &str = "+15550100";
const SIMULATED_CALLER: &str = "+15550199";

/// A message held in the simulated store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedMessage {
    /// Listed in text mode. `timestamp` uses the modem format
    /// `yy/MM/dd,hh:mm:ss±zz`.
    Text {
        sender: String,
        timestamp: String,
        body: String,
    },
    /// Listed in PDU mode, as hex.
    Pdu(String),
}

impl SimulatedMessage {
    /// A text message stamped with the current time.
    pub fn text(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Text {
            sender: sender.into(),
            timestamp: jiff::Timestamp::now()
                .strftime("%y/%m/%d,%H:%M:%S+00")
                .to_string(),
            body: body.into(),
        }
    }
}

/// An in-process modem answering the AT command subset the gateway uses.
///
/// Cloning yields another handle to the same modem. Each [`connect`] opens a
/// fresh link and closes the previous one; [`unplug`] closes the link and
/// refuses new ones until [`plug_in`].
///
/// [`connect`]: Self::connect
/// [`unplug`]: Self::unplug
/// [`plug_in`]: Self::plug_in
#[derive(Clone)]
pub struct SimulatedModem {
    inner: Arc<Mutex<ModemState>>,
}

struct ModemState {
    storage: String,
    mode: MessageMode,
    echo: bool,
    messages: BTreeMap<u32, SimulatedMessage>,
    call: Option<ActiveCall>,
    rejected: Vec<String>,
    commands: Vec<String>,
    plugged: bool,
    link: Option<Link>,
}

struct ActiveCall {
    number: Option<String>,
}

struct Link {
    urc: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl SimulatedModem {
    pub fn new(storage: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ModemState {
                storage: storage.to_string(),
                mode: MessageMode::Text,
                echo: true,
                messages: BTreeMap::new(),
                call: None,
                rejected: Vec::new(),
                commands: Vec::new(),
                plugged: true,
                link: None,
            })),
        }
    }

    /// Open a link to the modem. Must be called from within a tokio runtime.
    pub fn connect(&self) -> io::Result<DuplexStream> {
        let mut state = self.lock();
        if !state.plugged {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "simulated modem is unplugged",
            ));
        }
        if let Some(previous) = state.link.take() {
            previous.cancel.cancel();
        }

        let (host, device) = tokio::io::duplex(8192);
        let (urc_tx, urc_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        state.link = Some(Link {
            urc: urc_tx,
            cancel: cancel.clone(),
        });
        drop(state);

        tokio::spawn(self.clone().serve(device, urc_rx, cancel));
        Ok(host)
    }

    /// Store a message in the first free slot and announce it with `+CMTI`.
    pub fn deliver(&self, message: SimulatedMessage) -> u32 {
        let mut state = self.lock();
        let index = (0..)
            .find(|i| !state.messages.contains_key(i))
            .unwrap_or_default();
        state.store(index, message);
        index
    }

    /// Store a message at a given slot, replacing any previous one.
    pub fn store_at(&self, index: u32, message: SimulatedMessage) {
        self.lock().store(index, message);
    }

    pub fn message_indices(&self) -> Vec<u32> {
        self.lock().messages.keys().copied().collect()
    }

    /// Signal one ring of an incoming call, with caller id.
    pub fn ring(&self, number: Option<&str>) {
        let mut state = self.lock();
        if state.call.is_none() {
            state.call = Some(ActiveCall {
                number: number.map(str::to_string),
            });
        }
        state.send_urc("RING");
        match number {
            Some(number) => state.send_urc(&format!("+CLIP: \"{number}\",145,\"\",,\"\",0")),
            None => state.send_urc("+CLIP: \"\",128,\"\",,\"\",0"),
        }
    }

    /// End the current call.
    pub fn hang_up(&self) {
        let mut state = self.lock();
        if state.call.take().is_some() {
            state.send_urc("NO CARRIER");
        }
    }

    /// Answer commands starting with `prefix` with `ERROR`.
    pub fn reject(&self, prefix: &str) {
        self.lock().rejected.push(prefix.to_string());
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn unplug(&self) {
        let mut state = self.lock();
        state.plugged = false;
        if let Some(link) = state.link.take() {
            link.cancel.cancel();
        }
        info!("simulated modem unplugged");
    }

    pub fn plug_in(&self) {
        self.lock().plugged = true;
        info!("simulated modem plugged in");
    }

    /// Generate messages and calls until `cancel` fires. A zero interval
    /// disables that kind of traffic.
    pub fn spawn_traffic(
        &self,
        sms_interval: Duration,
        call_interval: Duration,
        cancel: CancellationToken,
    ) {
        if !sms_interval.is_zero() {
            let modem = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval_at(Instant::now() + sms_interval, sms_interval);
                let mut sent = 0u32;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            sent += 1;
                            let index = modem.deliver(SimulatedMessage::text(
                                SIMULATED_SENDER,
                                format!("Simulated message #{sent}"),
                            ));
                            debug!(index, "simulated message delivered");
                        }
                    }
                }
            });
        }

        if !call_interval.is_zero() {
            let modem = self.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval_at(Instant::now() + call_interval, call_interval);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            for _ in 0..3 {
                                modem.ring(Some(SIMULATED_CALLER));
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                                }
                            }
                            modem.hang_up();
                        }
                    }
                }
            });
        }
    }

    async fn serve(
        self,
        stream: DuplexStream,
        mut urcs: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_until(b'\r', &mut buf) => {
                    if !matches!(read, Ok(n) if n > 0) {
                        break;
                    }
                    let command = String::from_utf8_lossy(&buf).trim().to_string();
                    buf.clear();
                    if command.is_empty() {
                        continue;
                    }
                    let reply = self.respond(&command);
                    if writer.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(line) = urcs.recv() => {
                    if writer.write_all(format!("\r\n{line}\r\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("simulated modem link closed");
    }

    fn respond(&self, command: &str) -> String {
        let mut state = self.lock();
        state.commands.push(command.to_string());

        let mut out = String::new();
        if state.echo {
            out.push_str(command);
            out.push('\r');
        }

        let result = if state
            .rejected
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()))
        {
            Err("ERROR".to_string())
        } else {
            state.execute(command)
        };

        match result {
            Ok(lines) => {
                for line in lines {
                    out.push_str(&format!("\r\n{line}\r\n"));
                }
                out.push_str("\r\nOK\r\n");
            }
            Err(code) => out.push_str(&format!("\r\n{code}\r\n")),
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, ModemState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ModemState {
    fn store(&mut self, index: u32, message: SimulatedMessage) {
        self.messages.insert(index, message);
        let notice = format!("+CMTI: \"{}\",{index}", self.storage);
        self.send_urc(&notice);
    }

    fn send_urc(&self, line: &str) {
        if let Some(link) = &self.link {
            let _ = link.urc.send(line.to_string());
        }
    }

    fn execute(&mut self, command: &str) -> Result<Vec<String>, String> {
        let used = self.messages.len();
        match command {
            "AT" | "AT+CLIP=1" | "AT+CLIP=0" => Ok(Vec::new()),
            "ATE0" => {
                self.echo = false;
                Ok(Vec::new())
            }
            "ATE1" => {
                self.echo = true;
                Ok(Vec::new())
            }
            "AT+CMGF=1" => {
                self.mode = MessageMode::Text;
                Ok(Vec::new())
            }
            "AT+CMGF=0" => {
                self.mode = MessageMode::Pdu;
                Ok(Vec::new())
            }
            "AT+CSQ" => Ok(vec!["+CSQ: 20,99".to_string()]),
            "AT+CREG?" => Ok(vec!["+CREG: 0,1".to_string()]),
            "AT+CPMS?" => {
                let mem = &self.storage;
                let cap = STORE_CAPACITY;
                Ok(vec![format!(
                    "+CPMS: \"{mem}\",{used},{cap},\"{mem}\",{used},{cap},\"{mem}\",{used},{cap}"
                )])
            }
            "AT+CLCC" => Ok(self
                .call
                .iter()
                .map(|call| match &call.number {
                    Some(number) => {
                        let toa = if number.starts_with('+') { 145 } else { 129 };
                        format!("+CLCC: 1,1,4,0,0,\"{number}\",{toa}")
                    }
                    None => "+CLCC: 1,1,4,0,0".to_string(),
                })
                .collect()),
            "AT+CMGL=\"ALL\"" if self.mode == MessageMode::Text => Ok(self.list()),
            "AT+CMGL=4" if self.mode == MessageMode::Pdu => Ok(self.list()),
            _ => {
                if command.starts_with("AT+CSCS=") {
                    Ok(Vec::new())
                } else if command.starts_with("AT+CPMS=") {
                    let cap = STORE_CAPACITY;
                    Ok(vec![format!(
                        "+CPMS: {used},{cap},{used},{cap},{used},{cap}"
                    )])
                } else if let Some(index) = command.strip_prefix("AT+CMGR=") {
                    let index = parse_index(index)?;
                    self.read(index)
                } else if let Some(index) = command.strip_prefix("AT+CMGD=") {
                    let index = parse_index(index)?;
                    self.messages.remove(&index);
                    Ok(Vec::new())
                } else {
                    Err("ERROR".to_string())
                }
            }
        }
    }

    fn list(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (index, message) in &self.messages {
            match (self.mode, message) {
                (
                    MessageMode::Text,
                    SimulatedMessage::Text {
                        sender,
                        timestamp,
                        body,
                    },
                ) => {
                    lines.push(format!(
                        "+CMGL: {index},\"REC UNREAD\",\"{sender}\",,\"{timestamp}\""
                    ));
                    lines.push(body.clone());
                }
                (MessageMode::Pdu, SimulatedMessage::Pdu(pdu)) => {
                    lines.push(format!("+CMGL: {index},0,,{}", tpdu_length(pdu)));
                    lines.push(pdu.clone());
                }
                _ => {}
            }
        }
        lines
    }

    fn read(&self, index: u32) -> Result<Vec<String>, String> {
        match (self.mode, self.messages.get(&index)) {
            (
                MessageMode::Text,
                Some(SimulatedMessage::Text {
                    sender,
                    timestamp,
                    body,
                }),
            ) => Ok(vec![
                format!("+CMGR: \"REC READ\",\"{sender}\",,\"{timestamp}\""),
                body.clone(),
            ]),
            (MessageMode::Pdu, Some(SimulatedMessage::Pdu(pdu))) => Ok(vec![
                format!("+CMGR: 1,,{}", tpdu_length(pdu)),
                pdu.clone(),
            ]),
            _ => Err("+CMS ERROR: 321".to_string()),
        }
    }
}

fn parse_index(raw: &str) -> Result<u32, String> {
    raw.split(',')
        .next()
        .and_then(|index| index.trim().parse().ok())
        .ok_or_else(|| "+CMS ERROR: 321".to_string())
}

/// Octets after the service centre address, as reported by `<length>`.
fn tpdu_length(pdu: &str) -> usize {
    let smsc = pdu
        .get(..2)
        .and_then(|len| usize::from_str_radix(len, 16).ok())
        .unwrap_or(0);
    (pdu.len() / 2).saturating_sub(smsc + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smsgate_at::{AtCommand, AtSession, UrcKind, responses::parse_message_list};

    #[tokio::test]
    async fn answers_listing_and_delete() {
        let modem = SimulatedModem::new("ME");
        modem.store_at(
            3,
            SimulatedMessage::Text {
                sender: "+61412345678".into(),
                timestamp: "25/10/25,19:33:13+44".into(),
                body: "00540065007300740021".into(),
            },
        );
        let session = AtSession::new(modem.connect().unwrap());

        let listing = session
            .execute(&AtCommand::list_messages(MessageMode::Text))
            .await
            .unwrap();
        let messages = parse_message_list(&listing);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].index, 3);

        session.execute(&AtCommand::delete_message(3)).await.unwrap();
        assert!(modem.message_indices().is_empty());
        assert_eq!(
            modem.commands(),
            ["AT+CMGL=\"ALL\"", "AT+CMGD=3"]
        );
    }

    #[tokio::test]
    async fn ring_reaches_session_as_unsolicited() {
        let modem = SimulatedModem::new("ME");
        let session = AtSession::new(modem.connect().unwrap());

        modem.ring(Some("+61412345678"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let kinds: Vec<_> = session
            .poll_unsolicited()
            .unwrap()
            .iter()
            .map(|line| line.kind())
            .collect();
        assert_eq!(
            kinds,
            [
                UrcKind::Ring,
                UrcKind::CallerId(Some("+61412345678".into()))
            ]
        );
    }

    #[tokio::test]
    async fn unplug_closes_link_and_refuses_connect() {
        let modem = SimulatedModem::new("ME");
        let session = AtSession::new(modem.connect().unwrap());

        modem.unplug();
        let err = session.execute(&AtCommand::probe()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(modem.connect().is_err());

        modem.plug_in();
        assert!(modem.connect().is_ok());
    }

    #[test]
    fn pdu_length_excludes_service_centre() {
        assert_eq!(tpdu_length("0004"), 1);
        assert_eq!(tpdu_length("07911326040000F0040B"), 2);
    }
}
