pub mod api;
pub mod config;
pub mod dispatcher;
pub mod history;
pub mod monitor;
pub mod sink;
pub mod state;
pub mod supervisor;
pub mod tracker;
pub mod transport;

pub use config::{Config, DeviceConfig, FetchMode, TransportConfig};
pub use dispatcher::{EventPublisher, spawn_dispatcher};
pub use history::NotificationHistory;
pub use monitor::{DeviceMonitor, MonitorError, MonitorSettings};
pub use sink::{EventSink, LogSink, SinkError, TelegramSink};
pub use state::{DeviceRegistry, DeviceSnapshot};
pub use supervisor::{Supervisor, SupervisorSettings};
pub use tracker::{CallState, CallTracker};
pub use transport::{Connector, DeviceConnector, SimulatedMessage, SimulatedModem};
