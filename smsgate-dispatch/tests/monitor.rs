use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use smsgate_at::{AtSession, MessageMode};
use smsgate_core::{ConnectionStatus, Event};
use smsgate_dispatch::{
    DeviceConfig, DeviceMonitor, DeviceRegistry, EventSink, FetchMode, MonitorSettings,
    SimulatedMessage, SimulatedModem, SinkError, TransportConfig, spawn_dispatcher,
};
use tokio_util::sync::CancellationToken;

/// Records events, and which slots the modem still held when each arrived.
struct RecordingSink {
    modem: SimulatedModem,
    fail: bool,
    seen: Mutex<Vec<(Event, Vec<u32>)>>,
}

impl RecordingSink {
    fn new(modem: &SimulatedModem, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            modem: modem.clone(),
            fail,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.seen.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    fn calls(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Call(_)))
            .count()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &Event) -> Result<(), SinkError> {
        let stored = self.modem.message_indices();
        self.seen.lock().unwrap().push((event.clone(), stored));
        if self.fail {
            Err(SinkError::Rejected("chat unavailable".into()))
        } else {
            Ok(())
        }
    }
}

fn device() -> DeviceConfig {
    DeviceConfig {
        name: "modem-a".into(),
        message_mode: MessageMode::Text,
        storage: "ME".into(),
        fetch: FetchMode::Read,
        charset: None,
        transport: TransportConfig::Mock {
            sms_interval_secs: 0,
            call_interval_secs: 0,
        },
    }
}

fn settings(poll_interval: Duration, delete_after_forward: bool) -> MonitorSettings {
    MonitorSettings {
        poll_interval,
        call_poll_interval: Duration::from_millis(20),
        quiet_period: Duration::from_secs(2),
        command_timeout: Duration::from_millis(500),
        delete_after_forward,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Run a monitor against `modem` while `script` drives it, then stop it.
async fn with_monitor<F>(
    modem: &SimulatedModem,
    sink: Arc<RecordingSink>,
    settings: MonitorSettings,
    script: impl FnOnce(DeviceRegistry) -> F,
) -> HashSet<u32>
where
    F: Future<Output = ()>,
{
    with_device_monitor(device(), modem, sink, settings, script).await
}

async fn with_device_monitor<F>(
    device: DeviceConfig,
    modem: &SimulatedModem,
    sink: Arc<RecordingSink>,
    settings: MonitorSettings,
    script: impl FnOnce(DeviceRegistry) -> F,
) -> HashSet<u32>
where
    F: Future<Output = ()>,
{
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let registry = DeviceRegistry::new();
    registry.register("modem-a", "mock").await;
    let (publisher, _dispatcher) = spawn_dispatcher(sink, None, 8);
    let monitor = DeviceMonitor::new(device, settings, publisher, registry.clone());

    let session = AtSession::new(modem.connect().unwrap());
    let cancel = CancellationToken::new();
    let mut handled = HashSet::new();

    let script = script(registry);
    let (result, ()) = tokio::join!(monitor.run(&session, &mut handled, &cancel), async {
        script.await;
        cancel.cancel();
    });
    result.unwrap();
    handled
}

#[tokio::test]
async fn forwards_ucs2_message_then_deletes_it() {
    let modem = SimulatedModem::new("ME");
    modem.store_at(
        3,
        SimulatedMessage::Text {
            sender: "+61412345678".into(),
            timestamp: "25/10/25,19:33:13+44".into(),
            body: "0054006500730074".into(),
        },
    );
    let sink = RecordingSink::new(&modem, false);

    let watched = modem.clone();
    with_monitor(
        &modem,
        sink.clone(),
        settings(Duration::from_secs(10), true),
        move |_| async move { wait_until(|| watched.message_indices().is_empty()).await },
    )
    .await;

    let seen = sink.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    let (Event::Sms(sms), stored) = &seen[0] else {
        panic!("expected an sms event, got {:?}", seen[0].0);
    };
    assert_eq!(&*sms.sender_number, "+61412345678");
    assert_eq!(&*sms.body, "Test");
    assert_eq!(sms.raw_index, 3);
    assert_eq!(sms.timestamp.to_string(), "2025-10-25T08:33:13Z");
    assert_eq!(stored, &[3], "deleted before the sink accepted it");

    let deletes: Vec<_> = modem
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("AT+CMGD"))
        .collect();
    assert_eq!(deletes, ["AT+CMGD=3"]);
}

#[tokio::test]
async fn failed_delivery_keeps_message() {
    let modem = SimulatedModem::new("ME");
    modem.store_at(0, SimulatedMessage::text("+15550123", "keep me"));
    let sink = RecordingSink::new(&modem, true);

    let attempts = sink.clone();
    let handled = with_monitor(
        &modem,
        sink.clone(),
        settings(Duration::from_millis(50), true),
        move |_| async move { wait_until(|| attempts.events().len() >= 2).await },
    )
    .await;

    assert!(modem.commands().iter().all(|c| !c.starts_with("AT+CMGD")));
    assert_eq!(modem.message_indices(), [0]);
    assert!(handled.is_empty());
}

#[tokio::test]
async fn forwarded_message_is_not_repeated_without_delete() {
    let modem = SimulatedModem::new("ME");
    modem.store_at(5, SimulatedMessage::text("+15550123", "once"));
    let sink = RecordingSink::new(&modem, false);

    let watched = modem.clone();
    let handled = with_monitor(
        &modem,
        sink.clone(),
        settings(Duration::from_millis(30), false),
        move |_| async move {
            let lists = || {
                watched
                    .commands()
                    .iter()
                    .filter(|c| c.starts_with("AT+CMGL"))
                    .count()
            };
            wait_until(|| lists() >= 3).await;
        },
    )
    .await;

    assert_eq!(sink.events().len(), 1);
    assert_eq!(modem.message_indices(), [5]);
    assert!(handled.contains(&5));
}

#[tokio::test]
async fn undecodable_message_does_not_block_the_rest() {
    let modem = SimulatedModem::new("ME");
    modem.store_at(
        1,
        SimulatedMessage::Text {
            sender: "+15550123".into(),
            timestamp: "not a time".into(),
            body: "broken".into(),
        },
    );
    modem.store_at(2, SimulatedMessage::text("+15550124", "fine"));
    let sink = RecordingSink::new(&modem, false);

    let watched = modem.clone();
    let handled = with_monitor(
        &modem,
        sink.clone(),
        settings(Duration::from_secs(10), true),
        move |_| async move { wait_until(|| watched.message_indices() == [1]).await },
    )
    .await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].number(), "+15550124");
    assert!(handled.contains(&1));
}

#[tokio::test]
async fn ring_sequence_yields_one_call() {
    let modem = SimulatedModem::new("ME");
    let sink = RecordingSink::new(&modem, false);

    let ringer = modem.clone();
    let observed = sink.clone();
    with_monitor(
        &modem,
        sink.clone(),
        settings(Duration::from_secs(10), true),
        move |registry| async move {
            wait_until_ready(&registry).await;

            for _ in 0..4 {
                ringer.ring(Some("+61412345678"));
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
            wait_until(|| observed.calls() == 1).await;

            ringer.hang_up();
            tokio::time::sleep(Duration::from_millis(100)).await;
            ringer.ring(None);
            wait_until(|| observed.calls() == 2).await;
        },
    )
    .await;

    let calls: Vec<_> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Call(call) => Some(call),
            Event::Sms(_) => None,
        })
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(&*calls[0].caller_number, "+61412345678");
    assert!(calls[1].caller_withheld());
}

#[tokio::test]
async fn bodies_reading_like_result_codes_are_forwarded() {
    let modem = SimulatedModem::new("ME");
    modem.store_at(0, SimulatedMessage::text("+15550001", "OK"));
    modem.store_at(1, SimulatedMessage::text("+15550002", "RING"));
    modem.store_at(2, SimulatedMessage::text("+15550003", "hello"));
    let sink = RecordingSink::new(&modem, false);

    let watched = modem.clone();
    let handled = with_monitor(
        &modem,
        sink.clone(),
        settings(Duration::from_millis(30), false),
        move |_| async move {
            let lists = || {
                watched
                    .commands()
                    .iter()
                    .filter(|c| c.starts_with("AT+CMGL"))
                    .count()
            };
            wait_until(|| lists() >= 3).await;
        },
    )
    .await;

    let bodies: Vec<_> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Sms(sms) => Some((sms.raw_index, sms.body.to_string())),
            Event::Call(_) => None,
        })
        .collect();
    assert_eq!(
        bodies,
        [
            (0, "OK".to_owned()),
            (1, "RING".to_owned()),
            (2, "hello".to_owned())
        ]
    );
    assert_eq!(sink.calls(), 0);
    assert_eq!(handled, HashSet::from([0, 1, 2]));
}

#[tokio::test]
async fn pdu_mode_reads_decodes_and_deletes() {
    let modem = SimulatedModem::new("ME");
    // UCS2 "Hola" from +61412345678.
    modem.store_at(
        2,
        SimulatedMessage::Pdu("00040B911614325476F8000852015291333100080048006F006C0061".into()),
    );
    // 7-bit "Test" from +31641600986.
    modem.store_at(
        4,
        SimulatedMessage::Pdu("00040B911346610089F600005201529133310004D4F29C0E".into()),
    );
    let sink = RecordingSink::new(&modem, false);

    let pdu_device = DeviceConfig {
        message_mode: MessageMode::Pdu,
        ..device()
    };
    let watched = modem.clone();
    with_device_monitor(
        pdu_device,
        &modem,
        sink.clone(),
        settings(Duration::from_secs(10), true),
        move |_| async move { wait_until(|| watched.message_indices().is_empty()).await },
    )
    .await;

    let messages: Vec<_> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Sms(sms) => Some((
                sms.raw_index,
                sms.sender_number.to_string(),
                sms.body.to_string(),
            )),
            Event::Call(_) => None,
        })
        .collect();
    assert_eq!(
        messages,
        [
            (2, "+61412345678".to_owned(), "Hola".to_owned()),
            (4, "+31641600986".to_owned(), "Test".to_owned()),
        ]
    );

    let commands = modem.commands();
    for expected in ["AT+CMGF=0", "AT+CMGL=4", "AT+CMGR=2", "AT+CMGR=4"] {
        assert!(
            commands.iter().any(|c| c == expected),
            "{expected} not sent: {commands:?}"
        );
    }
    let deletes: Vec<_> = commands
        .iter()
        .filter(|c| c.starts_with("AT+CMGD"))
        .collect();
    assert_eq!(deletes, ["AT+CMGD=2", "AT+CMGD=4"]);
}

async fn wait_until_ready(registry: &DeviceRegistry) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(device) = registry.get("modem-a").await {
                if device.status == ConnectionStatus::Ready {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device never became ready");
}
