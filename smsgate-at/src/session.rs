use std::collections::VecDeque;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{
        Mutex,
        mpsc::{self, error::TryRecvError},
    },
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, trace, warn};

use crate::{AtCommand, AtResponse, Terminator, UnsolicitedLine};

const LINE_BUFFER: usize = 256;

/// How long a result-code-like payload line waits for a follower before it
/// is taken as the final result.
pub const PAYLOAD_GRACE: Duration = Duration::from_millis(200);

/// How long the reply to a timed-out command is waited for before the next
/// command goes out.
pub const LATE_REPLY_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out waiting for response to '{command}'")]
    Timeout { command: String },
    #[error("transport closed")]
    TransportClosed,
    #[error("modem rejected '{command}': {reason}")]
    ModemRejection { command: String, reason: String },
}

impl SessionError {
    /// Whether the session is unusable and must be reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Writer and line stream, held for the whole of a command exchange.
struct Exchange {
    writer: BoxedWriter,
    lines: mpsc::Receiver<String>,
    closed: bool,
    /// The last command timed out before its result arrived.
    abandoned: bool,
}

/// A line-oriented AT command session over any byte stream.
///
/// A background task splits incoming bytes into trimmed, non-empty lines.
/// [`execute`](Self::execute) serialises commands; lines that are not part
/// of the running command's response are queued and handed out by
/// [`poll_unsolicited`](Self::poll_unsolicited).
pub struct AtSession {
    exchange: Mutex<Exchange>,
    unsolicited: StdMutex<VecDeque<UnsolicitedLine>>,
    reader: JoinHandle<()>,
}

impl AtSession {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let reader = tokio::spawn(read_lines(reader, tx));

        Self {
            exchange: Mutex::new(Exchange {
                writer: Box::new(writer),
                lines: rx,
                closed: false,
                abandoned: false,
            }),
            unsolicited: StdMutex::new(VecDeque::new()),
            reader,
        }
    }

    /// Send `command` and collect its information lines up to the final
    /// result code.
    ///
    /// Known unsolicited codes that interleave the response are queued
    /// instead of being returned, as are lines left over from earlier
    /// exchanges. For commands with a
    /// [payload header](AtCommand::payload_header) the line after each
    /// header is kept as-is. When that line reads `OK` or `ERROR` it only
    /// counts as the final result if nothing follows within
    /// [`PAYLOAD_GRACE`].
    ///
    /// After a [`SessionError::Timeout`] the next call first waits up to
    /// [`LATE_REPLY_WINDOW`] for the abandoned command's result and
    /// discards it.
    pub async fn execute(&self, command: &AtCommand) -> Result<AtResponse, SessionError> {
        let mut exchange = self.exchange.lock().await;
        if std::mem::take(&mut exchange.abandoned) {
            self.discard_late_reply(&mut exchange).await;
        }
        self.divert_pending(&mut exchange)?;

        debug!(command = command.text(), "->");
        let mut payload = Vec::with_capacity(command.text().len() + 1);
        payload.extend_from_slice(command.text().as_bytes());
        payload.push(b'\r');

        let written = async {
            exchange.writer.write_all(&payload).await?;
            exchange.writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(command = command.text(), error = %e, "write failed");
            exchange.closed = true;
            return Err(SessionError::TransportClosed);
        }

        let deadline = Instant::now() + command.timeout();
        let mut body = Vec::new();
        let mut carried: Option<String> = None;
        let mut payload_next = false;

        loop {
            let line = match carried.take() {
                Some(line) => line,
                None => match tokio::time::timeout_at(deadline, exchange.lines.recv()).await {
                    Err(_) => {
                        exchange.abandoned = true;
                        return Err(SessionError::Timeout {
                            command: command.text().to_owned(),
                        });
                    }
                    Ok(None) => {
                        exchange.closed = true;
                        return Err(SessionError::TransportClosed);
                    }
                    Ok(Some(line)) => line,
                },
            };

            if std::mem::take(&mut payload_next) {
                if Terminator::parse(&line).is_none() {
                    body.push(line);
                    continue;
                }

                // Either a payload reading like a result code, or the
                // result right after a header with an empty payload.
                let grace = deadline.min(Instant::now() + PAYLOAD_GRACE);
                match tokio::time::timeout_at(grace, exchange.lines.recv()).await {
                    Ok(Some(next)) => {
                        trace!(line = %line, "payload resembles a result code");
                        body.push(line);
                        carried = Some(next);
                        continue;
                    }
                    Ok(None) => exchange.closed = true,
                    Err(_) => {}
                }
            }

            // Echo, when the modem has not been told ATE0 yet.
            if line == command.text() {
                continue;
            }

            match Terminator::parse(&line) {
                Some(Terminator::Ok) => return Ok(AtResponse::new(body)),
                Some(Terminator::Error(reason)) => {
                    return Err(SessionError::ModemRejection {
                        command: command.text().to_owned(),
                        reason,
                    });
                }
                None => {}
            }

            payload_next = command
                .payload_header()
                .is_some_and(|header| line.starts_with(header));

            let line = UnsolicitedLine::new(line);
            if line.is_known() {
                self.push_unsolicited(line);
            } else {
                body.push(line.into_text());
            }
        }
    }

    /// Drain every unsolicited line received so far.
    ///
    /// Never blocks and never waits for a running command. Returns
    /// [`SessionError::TransportClosed`] once the stream has ended and
    /// nothing is left to hand out.
    pub fn poll_unsolicited(&self) -> Result<Vec<UnsolicitedLine>, SessionError> {
        let mut closed = false;

        if let Ok(mut exchange) = self.exchange.try_lock() {
            if let Err(SessionError::TransportClosed) = self.divert_pending(&mut exchange) {
                closed = true;
            }
        }

        let lines: Vec<_> = self.queue().drain(..).collect();
        if lines.is_empty() && closed {
            return Err(SessionError::TransportClosed);
        }
        Ok(lines)
    }

    /// Shut down the write side and stop the reader.
    pub async fn close(self) {
        let mut exchange = self.exchange.lock().await;
        if let Err(e) = exchange.writer.shutdown().await {
            debug!(error = %e, "shutdown failed");
        }
        drop(exchange);
        self.reader.abort();
    }

    async fn discard_late_reply(&self, exchange: &mut Exchange) {
        loop {
            match tokio::time::timeout(LATE_REPLY_WINDOW, exchange.lines.recv()).await {
                Err(_) => break,
                Ok(None) => {
                    exchange.closed = true;
                    break;
                }
                Ok(Some(line)) => {
                    if Terminator::parse(&line).is_some() {
                        debug!(line = %line, "discarded late result");
                        break;
                    }
                    let line = UnsolicitedLine::new(line);
                    if line.is_known() {
                        self.push_unsolicited(line);
                    } else {
                        debug!(line = line.text(), "discarded late reply");
                    }
                }
            }
        }
    }

    fn divert_pending(&self, exchange: &mut Exchange) -> Result<(), SessionError> {
        loop {
            match exchange.lines.try_recv() {
                Ok(line) => self.push_unsolicited(UnsolicitedLine::new(line)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    exchange.closed = true;
                    break;
                }
            }
        }

        if exchange.closed {
            Err(SessionError::TransportClosed)
        } else {
            Ok(())
        }
    }

    fn push_unsolicited(&self, line: UnsolicitedLine) {
        trace!(line = line.text(), "queued unsolicited");
        self.queue().push_back(line);
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<UnsolicitedLine>> {
        self.unsolicited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AtSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("transport reached end of stream");
                break;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                for line in text.split('\r').map(str::trim).filter(|l| !l.is_empty()) {
                    trace!(line, "<-");
                    if tx.send(line.to_owned()).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "transport read failed");
                break;
            }
        }
    }
}
