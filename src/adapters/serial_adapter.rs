//! USB serial link to the fraction collector.
//!
//! Port discovery only needs `serialport` (feature `instrument_serial`);
//! the async [`SerialAdapter`] additionally needs `tokio-serial` (feature
//! `tokio_serial`).
//!
//! The adapter splits the port after opening it. A background task owns the
//! read half, splits the byte stream into lines and forwards them over a
//! channel, so a `next_line` call dropped by a timeout never loses a partial
//! line.

use crate::error::TransportError;
use serialport::SerialPortType;
use tracing::debug;

/// USB vendor id of genuine Arduino boards.
pub const ARDUINO_VENDOR_ID: u16 = 0x2341;

/// Serial ports whose USB vendor id matches `vendor_id`.
///
/// # Errors
/// Returns `TransportError::Io` if the OS port enumeration fails.
pub fn arduino_ports(vendor_id: u16) -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::Io(format!("Failed to list serial ports: {}", e)))?;

    let matching: Vec<String> = ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(info) if info.vid == vendor_id => Some(port.port_name),
            _ => None,
        })
        .collect();

    debug!(vendor_id = %format!("{:#06x}", vendor_id), found = matching.len(), "Scanned serial ports");
    Ok(matching)
}

#[cfg(feature = "tokio_serial")]
pub use self::stream::SerialAdapter;

#[cfg(feature = "tokio_serial")]
mod stream {
    use crate::adapters::LineAdapter;
    use crate::config::{SerialConfig, SerialFlowControl, SerialParity};
    use crate::error::TransportError;
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_serial::{SerialPortBuilderExt, SerialStream};
    use tracing::{debug, info, warn};

    /// Serial adapter for the collector's Arduino
    ///
    /// Defaults to 115200 baud, 8N1, no flow control and `\n` terminated
    /// commands.
    pub struct SerialAdapter {
        /// Port path (e.g. "/dev/ttyACM0", "COM3")
        port_name: String,

        baud_rate: u32,

        data_bits: tokio_serial::DataBits,

        parity: tokio_serial::Parity,

        stop_bits: tokio_serial::StopBits,

        flow_control: tokio_serial::FlowControl,

        /// Appended to every written line
        line_terminator: String,

        writer: Option<WriteHalf<SerialStream>>,
        lines: Option<mpsc::UnboundedReceiver<String>>,
        reader: Option<JoinHandle<()>>,
    }

    impl SerialAdapter {
        /// Create an adapter with the collector's default framing
        pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                port_name: port_name.into(),
                baud_rate,
                data_bits: tokio_serial::DataBits::Eight,
                parity: tokio_serial::Parity::None,
                stop_bits: tokio_serial::StopBits::One,
                flow_control: tokio_serial::FlowControl::None,
                line_terminator: "\n".to_string(),
                writer: None,
                lines: None,
                reader: None,
            }
        }

        /// Build from the `[serial]` configuration section
        ///
        /// # Errors
        /// Returns `TransportError::Open` if the framing values are out of
        /// range for a serial port.
        pub fn from_config(port_name: impl Into<String>, config: &SerialConfig) -> Result<Self, TransportError> {
            let port_name = port_name.into();
            let invalid = |reason: String| TransportError::Open {
                port: port_name.clone(),
                reason,
            };

            let data_bits = match config.data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                8 => tokio_serial::DataBits::Eight,
                other => return Err(invalid(format!("unsupported data bits: {}", other))),
            };
            let stop_bits = match config.stop_bits {
                1 => tokio_serial::StopBits::One,
                2 => tokio_serial::StopBits::Two,
                other => return Err(invalid(format!("unsupported stop bits: {}", other))),
            };

            Ok(Self::new(port_name.clone(), config.baud_rate)
                .with_framing(data_bits, config.parity.into(), stop_bits)
                .with_flow_control(config.flow_control.into())
                .with_line_terminator(config.line_terminator.clone()))
        }

        /// Set data bits, parity and stop bits
        pub fn with_framing(
            mut self,
            data_bits: tokio_serial::DataBits,
            parity: tokio_serial::Parity,
            stop_bits: tokio_serial::StopBits,
        ) -> Self {
            self.data_bits = data_bits;
            self.parity = parity;
            self.stop_bits = stop_bits;
            self
        }

        /// Set flow control
        pub fn with_flow_control(mut self, flow_control: tokio_serial::FlowControl) -> Self {
            self.flow_control = flow_control;
            self
        }

        /// Set the terminator appended to written lines
        pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
            self.line_terminator = terminator.into();
            self
        }

        /// Port path
        pub fn port_name(&self) -> &str {
            &self.port_name
        }

        fn shutdown_reader(&mut self) {
            if let Some(reader) = self.reader.take() {
                reader.abort();
            }
            self.lines = None;
        }
    }

    impl Drop for SerialAdapter {
        fn drop(&mut self) {
            self.shutdown_reader();
        }
    }

    #[async_trait]
    impl LineAdapter for SerialAdapter {
        fn name(&self) -> &str {
            "serial"
        }

        async fn connect(&mut self) -> Result<(), TransportError> {
            if self.writer.is_some() {
                debug!(port = %self.port_name, "Serial port already open");
                return Ok(());
            }

            let stream = tokio_serial::new(&self.port_name, self.baud_rate)
                .data_bits(self.data_bits)
                .parity(self.parity)
                .stop_bits(self.stop_bits)
                .flow_control(self.flow_control)
                .open_native_async()
                .map_err(|e| TransportError::Open {
                    port: self.port_name.clone(),
                    reason: e.to_string(),
                })?;

            let (read_half, write_half) = tokio::io::split(stream);
            let (tx, rx) = mpsc::unbounded_channel();
            let port = self.port_name.clone();

            let reader = tokio::spawn(async move {
                let mut lines = BufReader::new(read_half).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim_end_matches('\r').to_string();
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(%port, "Serial port reached end of stream");
                            break;
                        }
                        Err(e) => {
                            warn!(%port, error = %e, "Serial read failed");
                            break;
                        }
                    }
                }
            });

            self.writer = Some(write_half);
            self.lines = Some(rx);
            self.reader = Some(reader);

            info!(port = %self.port_name, baud = self.baud_rate, "Opened serial port");
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            self.shutdown_reader();
            if let Some(mut writer) = self.writer.take() {
                writer.shutdown().await?;
            }
            info!(port = %self.port_name, "Closed serial port");
            Ok(())
        }

        async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
            let writer = self.writer.as_mut().ok_or(TransportError::NotOpen)?;
            let framed = format!("{}{}", line, self.line_terminator);
            writer.write_all(framed.as_bytes()).await?;
            writer.flush().await?;
            Ok(())
        }

        async fn next_line(&mut self) -> Result<String, TransportError> {
            let lines = self.lines.as_mut().ok_or(TransportError::NotOpen)?;
            lines.recv().await.ok_or(TransportError::Closed)
        }

        fn try_next_line(&mut self) -> Option<String> {
            self.lines.as_mut()?.try_recv().ok()
        }
    }

    impl From<SerialParity> for tokio_serial::Parity {
        fn from(parity: SerialParity) -> Self {
            match parity {
                SerialParity::None => tokio_serial::Parity::None,
                SerialParity::Odd => tokio_serial::Parity::Odd,
                SerialParity::Even => tokio_serial::Parity::Even,
            }
        }
    }

    impl From<SerialFlowControl> for tokio_serial::FlowControl {
        fn from(flow: SerialFlowControl) -> Self {
            match flow {
                SerialFlowControl::None => tokio_serial::FlowControl::None,
                SerialFlowControl::Software => tokio_serial::FlowControl::Software,
                SerialFlowControl::Hardware => tokio_serial::FlowControl::Hardware,
            }
        }
    }

}
