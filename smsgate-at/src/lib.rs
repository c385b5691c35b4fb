mod command;
pub use command::*;
mod decode;
pub use decode::*;
pub mod gsm7;
pub mod responses;
pub use responses::{
    CallInfo, CallStatus, Registration, SignalQuality, StorageUsage, StoredMessage,
};
mod session;
pub use session::*;
mod urc;
pub use urc::*;
