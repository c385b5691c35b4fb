use std::collections::HashSet;
use std::time::Duration;

use jiff::Timestamp;
use smsgate_at::responses::{
    parse_call_list, parse_message_list, parse_read_message, parse_registration,
    parse_signal_quality, parse_storage_status,
};
use smsgate_at::{AtCommand, AtResponse, AtSession, SessionError, StoredMessage, UrcKind, decode_sms};
use smsgate_core::{CallEvent, ConnectionStatus, Event, EventId, EventKind, SmsEvent};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{Config, DeviceConfig, FetchMode};
use crate::dispatcher::EventPublisher;
use crate::state::DeviceRegistry;
use crate::tracker::CallTracker;

/// Timing and behaviour shared by every device monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub call_poll_interval: Duration,
    pub quiet_period: Duration,
    pub command_timeout: Duration,
    pub delete_after_forward: bool,
}

impl From<&Config> for MonitorSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            call_poll_interval: config.call_poll_interval(),
            quiet_period: config.quiet_period(),
            command_timeout: config.command_timeout(),
            delete_after_forward: config.delete_after_forward,
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    /// The modem could not be brought into a usable state.
    #[error("initialisation failed at '{command}': {source}")]
    Init {
        command: String,
        #[source]
        source: SessionError,
    },
    /// The session failed after the device was ready.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl MonitorError {
    /// Whether the monitor got as far as running its loops.
    pub fn reached_ready(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}

/// Drives one device's session: a fast loop for calls and a slow loop for
/// stored messages.
pub struct DeviceMonitor {
    device: DeviceConfig,
    settings: MonitorSettings,
    publisher: EventPublisher,
    registry: DeviceRegistry,
}

impl DeviceMonitor {
    pub fn new(
        device: DeviceConfig,
        settings: MonitorSettings,
        publisher: EventPublisher,
        registry: DeviceRegistry,
    ) -> Self {
        Self {
            device,
            settings,
            publisher,
            registry,
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    /// Initialise the modem, then poll until `cancel` fires or the session
    /// fails.
    ///
    /// `handled` holds the slots already forwarded (or skipped as
    /// undecodable) and outlives a single session, so a reconnect does not
    /// forward them again.
    #[instrument(name = "device_monitor", skip_all, fields(device = %self.device.name))]
    pub async fn run(
        &self,
        session: &AtSession,
        handled: &mut HashSet<u32>,
        cancel: &CancellationToken,
    ) -> Result<(), MonitorError> {
        self.initialise(session).await?;
        self.registry
            .set_status(&self.device.name, ConnectionStatus::Ready)
            .await;
        info!(mode = ?self.device.message_mode, "device ready");

        let loops = cancel.child_token();
        let wake = Notify::new();
        let (calls, messages) = tokio::join!(
            self.call_loop(session, &wake, &loops),
            self.message_loop(session, handled, &wake, &loops),
        );

        calls.and(messages)?;
        Ok(())
    }

    async fn initialise(&self, session: &AtSession) -> Result<(), MonitorError> {
        self.required(session, AtCommand::probe()).await?;
        self.optional(session, AtCommand::echo_off()).await?;
        self.required(session, AtCommand::message_format(self.device.message_mode))
            .await?;
        if let Some(charset) = &self.device.charset {
            self.optional(session, AtCommand::character_set(charset))
                .await?;
        }
        self.optional(session, AtCommand::preferred_storage(&self.device.storage))
            .await?;
        self.optional(session, AtCommand::caller_id(true)).await?;

        let signal = self
            .optional(session, AtCommand::signal_quality())
            .await?
            .and_then(|response| parse_signal_quality(&response));
        let storage = self
            .optional(session, AtCommand::storage_status())
            .await?
            .and_then(|response| parse_storage_status(&response));
        let registration = self
            .optional(session, AtCommand::registration())
            .await?
            .and_then(|response| parse_registration(&response));

        info!(
            signal = ?signal.and_then(|s| s.percent()),
            storage = ?storage.as_ref().map(|s| format!("{}/{}", s.used, s.total)),
            registration = registration.as_ref().map(|r| r.status()),
            "modem initialised"
        );
        self.registry
            .update_info(&self.device.name, signal, storage, registration)
            .await;
        Ok(())
    }

    async fn required(
        &self,
        session: &AtSession,
        command: AtCommand,
    ) -> Result<AtResponse, MonitorError> {
        self.execute(session, &command)
            .await
            .map_err(|source| MonitorError::Init {
                command: command.text().to_owned(),
                source,
            })
    }

    /// Run a set-up command whose rejection the gateway can live with.
    async fn optional(
        &self,
        session: &AtSession,
        command: AtCommand,
    ) -> Result<Option<AtResponse>, MonitorError> {
        match self.execute(session, &command).await {
            Ok(response) => Ok(Some(response)),
            Err(source) if source.is_fatal() => Err(MonitorError::Init {
                command: command.text().to_owned(),
                source,
            }),
            Err(e) => {
                warn!(command = command.text(), error = %e, "optional setup command failed");
                Ok(None)
            }
        }
    }

    async fn execute(
        &self,
        session: &AtSession,
        command: &AtCommand,
    ) -> Result<AtResponse, SessionError> {
        let command = command.clone().with_timeout(self.settings.command_timeout);
        session.execute(&command).await
    }

    async fn call_loop(
        &self,
        session: &AtSession,
        wake: &Notify,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let mut tracker = CallTracker::new(self.device.name.as_str(), self.settings.quiet_period);
        let mut interval = tokio::time::interval(self.settings.call_poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            if let Err(e) = self.call_cycle(session, &mut tracker, wake).await {
                warn!(error = %e, "call loop stopped");
                cancel.cancel();
                return Err(e);
            }
        }
    }

    async fn call_cycle(
        &self,
        session: &AtSession,
        tracker: &mut CallTracker,
        wake: &Notify,
    ) -> Result<(), SessionError> {
        let now = Instant::now();
        for line in session.poll_unsolicited()? {
            match line.kind() {
                UrcKind::Ring => tracker.on_ring(now),
                UrcKind::CallerId(number) => tracker.on_caller_id(number, now),
                UrcKind::CallEnded => tracker.on_hangup(),
                UrcKind::NewMessage { storage, index } => {
                    debug!(%storage, index, "new message indicated");
                    wake.notify_one();
                }
                UrcKind::Other => trace!(line = line.text(), "unsolicited line ignored"),
            }
        }

        if tracker.needs_confirmation() {
            let event = match self.execute(session, &AtCommand::list_calls()).await {
                Ok(response) => tracker.on_call_list(&parse_call_list(&response), Instant::now()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "call list query failed");
                    tracker.on_call_list_failed(Instant::now())
                }
            };
            if let Some(event) = event {
                self.forward_call(event).await;
            }
        }

        tracker.expire(Instant::now());
        Ok(())
    }

    async fn forward_call(&self, event: CallEvent) {
        debug!(caller = %event.caller_number, call_type = event.call_type.as_str(), "incoming call");
        match self.publisher.publish(Event::Call(event)).await {
            Ok(()) => {
                self.registry
                    .record_forwarded(&self.device.name, EventKind::Call)
                    .await
            }
            // Nothing on the modem to retry against.
            Err(e) => warn!(error = %e, "call notification not delivered"),
        }
    }

    async fn message_loop(
        &self,
        session: &AtSession,
        handled: &mut HashSet<u32>,
        wake: &Notify,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.message_cycle(session, handled, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "message loop stopped");
                    cancel.cancel();
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "message poll failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = wake.notified() => debug!("polling messages early"),
            }
        }
    }

    async fn message_cycle(
        &self,
        session: &AtSession,
        handled: &mut HashSet<u32>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let listing = self
            .execute(session, &AtCommand::list_messages(self.device.message_mode))
            .await?;
        let messages = parse_message_list(&listing);
        handled.retain(|index| messages.iter().any(|m| m.index == *index));
        if !messages.is_empty() {
            debug!(count = messages.len(), "messages listed");
        }

        for listed in messages {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if handled.contains(&listed.index) {
                continue;
            }

            let message = match self.device.fetch {
                FetchMode::List => listed,
                FetchMode::Read => self.read(session, listed).await?,
            };
            self.forward_message(session, message, handled).await?;
        }

        self.refresh_signal(session).await
    }

    /// Re-read a listed slot. Falls back to the listed copy when the read
    /// is rejected.
    async fn read(
        &self,
        session: &AtSession,
        listed: StoredMessage,
    ) -> Result<StoredMessage, SessionError> {
        let index = listed.index;
        match self.execute(session, &AtCommand::read_message(index)).await {
            Ok(response) => Ok(parse_read_message(index, &response).unwrap_or(listed)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(index, error = %e, "read failed, using listed copy");
                Ok(listed)
            }
        }
    }

    async fn forward_message(
        &self,
        session: &AtSession,
        message: StoredMessage,
        handled: &mut HashSet<u32>,
    ) -> Result<(), SessionError> {
        let index = message.index;
        let decoded = match decode_sms(&message.header, &message.body, self.device.message_mode) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(index, error = %e, "skipping undecodable message");
                handled.insert(index);
                return Ok(());
            }
        };

        let event = SmsEvent {
            id: EventId::new(),
            device: self.device.name.as_str().into(),
            sender_number: decoded.sender.into(),
            timestamp: decoded.timestamp.unwrap_or_else(Timestamp::now),
            body: decoded.body.into(),
            raw_index: index,
            part: decoded.part,
        };

        if let Err(e) = self.publisher.publish(Event::Sms(event)).await {
            warn!(index, error = %e, "message not delivered, keeping it on the modem");
            return Ok(());
        }
        handled.insert(index);
        self.registry
            .record_forwarded(&self.device.name, EventKind::Sms)
            .await;

        if self.settings.delete_after_forward {
            match self
                .execute(session, &AtCommand::delete_message(index))
                .await
            {
                Ok(_) => {
                    handled.remove(&index);
                    info!(index, "message deleted");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(index, error = %e, "failed to delete message"),
            }
        }
        Ok(())
    }

    async fn refresh_signal(&self, session: &AtSession) -> Result<(), SessionError> {
        match self.execute(session, &AtCommand::signal_quality()).await {
            Ok(response) => {
                self.registry
                    .update_signal(&self.device.name, parse_signal_quality(&response))
                    .await
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!(error = %e, "signal query failed"),
        }
        Ok(())
    }
}
