//! Blocking serial I/O bridged onto channels.
//!
//! The UART is driven by two dedicated blocking tasks: a reader that pushes
//! raw byte chunks (or a single terminal error) into the ingress channel, and
//! a writer that drains the egress channel onto the port. The transport only
//! ever sees channels, which keeps it testable without hardware.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits, TTYPort};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use crate::settings::Serial;

const READ_CHUNK: usize = 256;
const READ_POLL: Duration = Duration::from_millis(100);
const CHANNEL_DEPTH: usize = 32;

/// The channel ends the link layer plugs into.
pub struct SerialLink {
    pub bytes_in: mpsc::Receiver<std::io::Result<BytesMut>>,
    pub wire_out: mpsc::Sender<Bytes>,
}

/// Open the port 8-N-1 at the configured baudrate and spawn the I/O tasks.
pub fn open(settings: &Serial) -> serialport::Result<SerialLink> {
    let port = serialport::new(settings.device.to_string_lossy(), settings.baudrate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(settings.flow_control.into())
        .timeout(READ_POLL)
        .open_native()?;
    let writer_port = port.try_clone_native()?;
    port.clear(ClearBuffer::All)?;
    debug!(device = %settings.device.display(), baudrate = settings.baudrate, "Serial port opened");

    let (ingress, bytes_in) = mpsc::channel(CHANNEL_DEPTH);
    let (wire_out, egress) = mpsc::channel(CHANNEL_DEPTH);
    spawn_blocking(reader(port, ingress));
    spawn_blocking(writer(writer_port, egress));

    Ok(SerialLink { bytes_in, wire_out })
}

fn reader(
    mut port: TTYPort,
    ingress: mpsc::Sender<std::io::Result<BytesMut>>,
) -> impl FnOnce() + Send {
    move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match port.read(&mut buf) {
                Ok(0) => {
                    let _ = ingress.blocking_send(Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "serial port closed",
                    )));
                    break;
                }
                Ok(n) => {
                    if ingress.blocking_send(Ok(BytesMut::from(&buf[..n]))).is_err() {
                        // Nobody is listening anymore.
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Serial read failed");
                    let _ = ingress.blocking_send(Err(e));
                    break;
                }
            }
        }
    }
}

fn writer(mut port: TTYPort, mut egress: mpsc::Receiver<Bytes>) -> impl FnOnce() + Send {
    move || {
        while let Some(chunk) = egress.blocking_recv() {
            if let Err(e) = port.write_all(&chunk).and_then(|_| port.flush()) {
                warn!(error = %e, "Serial write failed");
                break;
            }
        }
        // Dropping the receiver makes further transport writes fail, which
        // the link layer reports as a lost connection.
    }
}
