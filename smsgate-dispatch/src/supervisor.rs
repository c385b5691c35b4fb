use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use smsgate_at::AtSession;
use smsgate_core::ConnectionStatus;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::config::{Config, DeviceConfig};
use crate::dispatcher::EventPublisher;
use crate::monitor::{DeviceMonitor, MonitorSettings};
use crate::state::DeviceRegistry;
use crate::transport::Connector;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            initial_backoff: Duration::from_secs(config.supervisor.reconnect_backoff_secs),
            max_backoff: Duration::from_secs(config.supervisor.max_backoff_secs),
        }
    }
}

/// Keeps one monitor running per configured device, reconnecting faulted
/// devices until shutdown.
pub struct Supervisor {
    devices: Vec<DeviceConfig>,
    monitor: MonitorSettings,
    settings: SupervisorSettings,
    connector: Arc<dyn Connector>,
    publisher: EventPublisher,
    registry: DeviceRegistry,
}

impl Supervisor {
    pub fn new(
        devices: Vec<DeviceConfig>,
        monitor: MonitorSettings,
        settings: SupervisorSettings,
        connector: Arc<dyn Connector>,
        publisher: EventPublisher,
        registry: DeviceRegistry,
    ) -> Self {
        Self {
            devices,
            monitor,
            settings,
            connector,
            publisher,
            registry,
        }
    }

    /// Register every device and start its task. The tasks end once
    /// `cancel` fires.
    pub async fn spawn(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.devices.len());

        for device in self.devices {
            self.registry
                .register(&device.name, &device.transport.endpoint())
                .await;

            let monitor = DeviceMonitor::new(
                device,
                self.monitor,
                self.publisher.clone(),
                self.registry.clone(),
            );
            handles.push(tokio::spawn(supervise(
                monitor,
                Arc::clone(&self.connector),
                self.registry.clone(),
                self.settings,
                cancel.clone(),
            )));
        }

        info!(devices = handles.len(), "supervisor started");
        handles
    }
}

#[instrument(name = "device_supervisor", skip_all, fields(device = %monitor.device().name))]
async fn supervise(
    monitor: DeviceMonitor,
    connector: Arc<dyn Connector>,
    registry: DeviceRegistry,
    settings: SupervisorSettings,
    cancel: CancellationToken,
) {
    let name = monitor.device().name.clone();
    let endpoint = monitor.device().transport.endpoint();
    let mut handled = HashSet::new();
    let mut backoff = settings.initial_backoff;

    while !cancel.is_cancelled() {
        registry.set_status(&name, ConnectionStatus::Connecting).await;

        let fault = match connector.connect(monitor.device()).await {
            Ok(stream) => {
                info!(%endpoint, "transport opened");
                let session = AtSession::new(stream);
                let result = monitor.run(&session, &mut handled, &cancel).await;
                session.close().await;

                match result {
                    Ok(()) => break,
                    Err(e) => {
                        if e.reached_ready() {
                            backoff = settings.initial_backoff;
                        }
                        e.to_string()
                    }
                }
            }
            Err(e) => format!("failed to open {endpoint}: {e}"),
        };

        error!(error = %fault, backoff_secs = backoff.as_secs_f32(), "device faulted, will retry");
        registry.record_fault(&name, &fault).await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(settings.max_backoff);
        registry.record_restart(&name).await;
    }

    registry
        .set_status(&name, ConnectionStatus::Disconnected)
        .await;
    info!("device stopped");
}
