use std::io;

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

/// Open a serial modem port, 8N1 without flow control.
pub fn open(port: &str, baud_rate: u32) -> io::Result<SerialStream> {
    let stream = tokio_serial::new(port, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()?;

    info!(port, baud_rate, "serial port opened");
    Ok(stream)
}
