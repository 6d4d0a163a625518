use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::serial::{
    codecs::lines::{LinesCodec, MAX_LINE_LENGTH},
    error::SerialPortError,
    TransportEvent, TransportHandle,
};

/// Builder for a serial port [`TransportHandle`].
#[derive(Debug, Default)]
pub struct SerialPortBuilder {
    baud: Option<u32>,
    flow_control: Option<serialport::FlowControl>,
    max_line_length: Option<usize>,
    path: String,
}

fn try_create_serial_port(
    baud: u32,
    flow_control: serialport::FlowControl,
    path: &str,
) -> Result<SerialStream, SerialPortError> {
    tokio_serial::new(path, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(flow_control)
        .open_native_async()
        .map_err(|e| SerialPortError::Open {
            path: path.to_string(),
            problem: e.to_string(),
        })
}

impl SerialPortBuilder {
    /// Start a new builder.
    /// The tty should likely be along the lines of `/dev/ttyUSBx` on unix, and `COMx` on Windows.
    pub fn new(tty: &str) -> Self {
        Self {
            path: tty.to_string(),
            ..Default::default()
        }
    }

    /// Set the serial port builder's baud.
    /// Will use 115_200 if not set.
    pub fn set_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// Set the flow control. None if not set.
    pub fn set_flow_control(mut self, flow_control: serialport::FlowControl) -> Self {
        self.flow_control = Some(flow_control);
        self
    }

    /// Lines longer than this are dropped.
    /// Will use 4096 bytes if not set.
    pub fn set_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = Some(max_line_length);
        self
    }

    /// Open the port and start moving lines.
    ///
    /// Fails right away if the port can not be opened.
    pub fn build(self) -> Result<TransportHandle, SerialPortError> {
        let baud = self.baud.unwrap_or(115_200);
        let flow_control = self.flow_control.unwrap_or(serialport::FlowControl::None);

        info!(%self.path, %baud, ?flow_control, "Starting serial port handler");

        let serial_stream = try_create_serial_port(baud, flow_control, &self.path)?;

        let (writes_tx, mut writes_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let codec = LinesCodec::default()
            .with_max_length(self.max_line_length.unwrap_or(MAX_LINE_LENGTH));
        let tty_span = info_span!("tty", %self.path);

        let task = tokio::spawn(
            async move {
                // Sink: Send things (to serial port), stream: receive things (from serial port)
                let (mut sink, mut stream) = codec.framed(serial_stream).split();

                let reason = loop {
                    tokio::select! {
                        to_write = writes_rx.recv() => {
                            let Some(line) = to_write else {
                                break "owner dropped".to_string();
                            };

                            let event = match sink.send(line.clone()).await {
                                Ok(()) => {
                                    trace!(line = %line.trim_end(), "Put on wire");
                                    TransportEvent::Written(line)
                                }
                                Err(e) => {
                                    error!(?e, "Serial port error in send");
                                    TransportEvent::WriteFailed(e)
                                }
                            };

                            if events_tx.send(event).is_err() {
                                break "owner dropped".to_string();
                            }
                        }
                        from_wire = stream.next() => {
                            match from_wire {
                                Some(Ok(line)) if line.trim().is_empty() => continue,
                                Some(Ok(line)) => {
                                    trace!(%line, "Message from port");
                                    if events_tx.send(TransportEvent::Line(line)).is_err() {
                                        break "owner dropped".to_string();
                                    }
                                }
                                Some(Err(e)) => {
                                    error!(?e, "Serial port error, exiting");
                                    break e.to_string();
                                }
                                None => {
                                    warn!("Serial port stream ended");
                                    break SerialPortError::Disconnected.to_string();
                                }
                            }
                        }
                    }
                };

                debug!(%reason, "Serial port handler stopping");
                let _ = events_tx.send(TransportEvent::Closed(reason));
            }
            .instrument(tty_span),
        );

        Ok(TransportHandle {
            path: self.path,
            writes: writes_tx,
            events: events_rx,
            task,
        })
    }
}

/// List the serial ports present on this host.
pub(crate) fn available_ports() -> Result<Vec<serialport::SerialPortInfo>, SerialPortError> {
    tokio_serial::available_ports().map_err(|e| SerialPortError::Open {
        path: "*".into(),
        problem: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_port_fails_fast() {
        let result = SerialPortBuilder::new("/dev/this-port-does-not-exist")
            .set_baud(9600)
            .build();

        assert!(matches!(result, Err(SerialPortError::Open { .. })));
    }
}
