//! Wire protocol for the Aegis session transport.
//!
//! Inbound messages are JSON `{command, args}` requests. Outbound messages
//! are either raw text fragments (assistant narration, shell output) or small
//! JSON envelopes: `{result}`, `{error}`, `{stdin_request}`,
//! `{returned_file, data}`.

pub mod frames;

pub use frames::{InboundRequest, OutboundFrame};
