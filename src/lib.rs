//! Host-side driver for Silicon Labs EmberZNet NCPs attached over UART.
//!
//! The stack has three layers. [`ash`] is the link layer: frame codecs,
//! checksums and the sliding-window engine that keeps payloads flowing over
//! a lossy serial line. [`ezsp`] multiplexes commands onto that link and
//! fans unsolicited callbacks out to handlers. [`gateway`] ties both to a
//! real serial port and exposes the surface applications use.

pub mod ash;
pub mod ezsp;
pub mod gateway;
pub mod logging;
pub mod serial;
pub mod settings;

pub use gateway::{connect, Gateway, Startup};
pub use logging::setup_logging;
pub use settings::Settings;
