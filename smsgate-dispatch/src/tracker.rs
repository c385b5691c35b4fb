use std::time::Duration;

use smsgate_at::CallInfo;
use smsgate_core::{CallDirection, CallEvent, CallType, EventId, UNKNOWN_CALLER};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Ring activity seen, waiting for the call list to confirm it.
    Ringing,
    /// An event was emitted for the current call.
    Notified,
}

/// Collapses the ring indications of one call into a single [`CallEvent`].
///
/// Owned by a device's fast loop. Feed it unsolicited ring and caller-id
/// lines, and the result of `AT+CLCC` whenever
/// [`needs_confirmation`](Self::needs_confirmation) says so.
#[derive(Debug)]
pub struct CallTracker {
    device: Box<str>,
    quiet_period: Duration,
    state: CallState,
    last_activity: Option<Instant>,
    caller_id: Option<String>,
    /// Ring activity not yet checked against the call list.
    unconfirmed_ring: bool,
}

impl CallTracker {
    pub fn new(device: impl Into<Box<str>>, quiet_period: Duration) -> Self {
        Self {
            device: device.into(),
            quiet_period,
            state: CallState::Idle,
            last_activity: None,
            caller_id: None,
            unconfirmed_ring: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn needs_confirmation(&self) -> bool {
        match self.state {
            CallState::Idle => false,
            CallState::Ringing | CallState::Notified => self.unconfirmed_ring,
        }
    }

    pub fn on_ring(&mut self, now: Instant) {
        self.last_activity = Some(now);
        if self.state == CallState::Idle {
            debug!(device = %self.device, "ring detected");
            self.state = CallState::Ringing;
        }
        self.unconfirmed_ring = true;
    }

    /// A `+CLIP` line; counts as ring activity.
    pub fn on_caller_id(&mut self, number: Option<String>, now: Instant) {
        if number.is_some() {
            self.caller_id = number;
        }
        self.on_ring(now);
    }

    /// The network reported the call ended.
    pub fn on_hangup(&mut self) {
        if self.state != CallState::Idle {
            debug!(device = %self.device, "call ended");
        }
        self.reset();
    }

    /// Advance with a fresh `AT+CLCC` result.
    pub fn on_call_list(&mut self, calls: &[CallInfo], now: Instant) -> Option<CallEvent> {
        if calls.is_empty() {
            if self.state != CallState::Idle {
                debug!(device = %self.device, "no calls listed, back to idle");
            }
            self.reset();
            return None;
        }

        let incoming = calls.iter().find(|call| call.is_incoming());
        match (self.state, incoming) {
            (CallState::Idle | CallState::Ringing, Some(call)) => {
                self.last_activity = Some(now);
                let number = call.number.clone().or_else(|| self.caller_id.clone());
                Some(self.notify(number, call.direction, call.call_type))
            }
            (_, None) | (CallState::Notified, _) => {
                self.unconfirmed_ring = false;
                None
            }
        }
    }

    /// `AT+CLCC` could not be completed. A pending ring is still reported,
    /// with whatever caller id is known.
    pub fn on_call_list_failed(&mut self, now: Instant) -> Option<CallEvent> {
        match self.state {
            CallState::Ringing => {
                self.last_activity = Some(now);
                let number = self.caller_id.clone();
                Some(self.notify(number, CallDirection::Incoming, CallType::Voice))
            }
            CallState::Notified => {
                self.unconfirmed_ring = false;
                None
            }
            CallState::Idle => None,
        }
    }

    /// Return to idle once no ring activity was seen for the quiet period.
    pub fn expire(&mut self, now: Instant) {
        let Some(last) = self.last_activity else {
            return;
        };
        if self.state != CallState::Idle && now.saturating_duration_since(last) >= self.quiet_period
        {
            debug!(device = %self.device, "ring activity quiet, back to idle");
            self.reset();
        }
    }

    fn notify(
        &mut self,
        number: Option<String>,
        direction: CallDirection,
        call_type: CallType,
    ) -> CallEvent {
        self.state = CallState::Notified;
        self.unconfirmed_ring = false;

        CallEvent {
            id: EventId::new(),
            device: self.device.clone(),
            caller_number: number.unwrap_or_else(|| UNKNOWN_CALLER.to_string()).into(),
            direction,
            call_type,
            timestamp: jiff::Timestamp::now(),
        }
    }

    fn reset(&mut self) {
        self.state = CallState::Idle;
        self.last_activity = None;
        self.caller_id = None;
        self.unconfirmed_ring = false;
    }
}
