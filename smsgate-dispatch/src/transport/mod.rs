pub mod mock;
pub mod serial;

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::{DeviceConfig, TransportConfig};
pub use mock::{SimulatedMessage, SimulatedModem};

/// Byte stream a modem is reached over.
pub trait ModemStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ModemStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ModemStream>;

/// Opens the transport of a configured device.
///
/// The supervisor calls this again after every fault, so implementations
/// must be able to reopen the same device.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, device: &DeviceConfig) -> io::Result<BoxedStream>;
}

/// Connector for the transports a [`DeviceConfig`] can name.
///
/// Mock devices get one [`SimulatedModem`] each, kept across reconnects and
/// fed with generated traffic until `cancel` fires.
pub struct DeviceConnector {
    simulated: Mutex<HashMap<String, SimulatedModem>>,
    cancel: CancellationToken,
}

impl DeviceConnector {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            simulated: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// The simulated modem behind a mock device, once it was connected.
    pub fn simulated(&self, name: &str) -> Option<SimulatedModem> {
        self.simulated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl Connector for DeviceConnector {
    async fn connect(&self, device: &DeviceConfig) -> io::Result<BoxedStream> {
        match &device.transport {
            TransportConfig::Serial { port, baud_rate } => {
                Ok(Box::new(serial::open(port, *baud_rate)?))
            }
            TransportConfig::Mock {
                sms_interval_secs,
                call_interval_secs,
            } => {
                let modem = self
                    .simulated
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(device.name.clone())
                    .or_insert_with(|| {
                        let modem = SimulatedModem::new(&device.storage);
                        modem.spawn_traffic(
                            Duration::from_secs(*sms_interval_secs),
                            Duration::from_secs(*call_interval_secs),
                            self.cancel.child_token(),
                        );
                        modem
                    })
                    .clone();

                Ok(Box::new(modem.connect()?))
            }
        }
    }
}
