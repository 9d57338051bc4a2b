//! Jupyter message envelopes for the Jupyter server kernel WebSocket.
//!
//! A Jupyter server multiplexes every kernel channel over a single
//! WebSocket at `/api/kernels/{id}/channels`. Each frame carries one
//! message with an extra `channel` field naming the ZeroMQ channel it
//! belongs to.
//!
//! # Features
//!
//! - Text frames: plain JSON envelopes (`encode_text` / `decode_text`)
//! - Binary frames: the offset-table layout used when a message carries
//!   binary buffers (`encode_binary` / `decode_binary`)
//! - Conversion to/from `jupyter_protocol::JupyterMessage`

mod frame;
mod message;

pub use frame::{decode_binary, encode_binary};
pub use message::{decode_text, encode_text, InboundEnvelope, OutboundEnvelope, WireError};
