//! The ASH (Asynchronous Serial Host) link layer: framing, checksums,
//! payload masking, and the sliding-window transmission engine that keeps
//! EZSP payloads flowing over the UART.

mod checksum;
mod codec;
pub mod constants;
mod error;
mod escaping;
mod frame;
mod pseudo_random;
mod transport;
mod types;

pub use codec::AshCodec;
pub use error::{Error, Result};
pub use frame::Frame;
pub use transport::{create_ash_transport, AshHandle, AshTransport, TransportEvent};
pub use types::FrameNumber;
