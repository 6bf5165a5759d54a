//! The EZSP application layer: envelope codecs, command tables, the shared
//! parameter codec and the multiplexer that pairs commands with responses
//! and fans callbacks out to handlers.

mod client;
mod envelope;
mod error;
mod table;
pub mod value;

pub use client::{
    create_ezsp_client, CallbackHandler, Collector, EzspClient, EzspHandle, RESET_CALLBACK,
};
pub use envelope::{Envelope, EnvelopeCodec, MAX_PROTOCOL_VERSION};
pub use error::{Error, Result};
pub use table::{CommandDef, CommandTable};
pub use value::Value;
