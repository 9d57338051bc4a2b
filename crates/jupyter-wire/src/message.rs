//! JSON envelopes exchanged with the Jupyter server WebSocket.

use bytes::Bytes;
use jupyter_protocol::{Channel, Header, JupyterMessage, JupyterMessageContent};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Reasons a frame could not be turned into a message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{msg_type} content did not match its schema: {reason}")]
    Content { msg_type: String, reason: String },

    #[error("Malformed binary frame: {0}")]
    MalformedFrame(String),
}

/// A message as it arrives from the server, before `content` is typed.
///
/// Servers send `{}` or `null` for a missing parent header, and may omit
/// `metadata` and `channel`. Buffers only arrive in binary frames.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    pub header: Header,
    #[serde(default, deserialize_with = "jupyter_protocol::deserialize_parent_header")]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Value,
    pub content: Value,
    #[serde(default)]
    pub channel: Option<Channel>,
}

impl InboundEnvelope {
    /// Type the content by `msg_type` and attach any binary buffers.
    pub fn into_message(self, buffers: Vec<Bytes>) -> Result<JupyterMessage, WireError> {
        let InboundEnvelope {
            header,
            parent_header,
            metadata,
            content,
            channel,
        } = self;
        let typed = JupyterMessageContent::from_type_and_content(&header.msg_type, content)
            .map_err(|e| WireError::Content {
                msg_type: header.msg_type.clone(),
                reason: e.to_string(),
            })?;
        Ok(JupyterMessage {
            zmq_identities: Vec::new(),
            header,
            parent_header,
            metadata,
            content: typed,
            buffers,
            channel,
        })
    }
}

/// Outgoing envelope. Borrowed from a `JupyterMessage` so encoding never
/// clones content.
#[derive(Debug, Serialize)]
pub struct OutboundEnvelope<'a> {
    pub header: &'a Header,

    /// The kernel expects `{}` rather than `null` for a missing parent.
    #[serde(serialize_with = "serialize_parent_header")]
    pub parent_header: &'a Option<Header>,

    pub metadata: &'a Value,

    pub content: &'a JupyterMessageContent,

    pub channel: Channel,
}

impl<'a> OutboundEnvelope<'a> {
    pub fn new(message: &'a JupyterMessage, channel: Channel) -> Self {
        OutboundEnvelope {
            header: &message.header,
            parent_header: &message.parent_header,
            metadata: &message.metadata,
            content: &message.content,
            channel,
        }
    }
}

fn serialize_parent_header<S>(header: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match header {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

/// Encode a message for a text frame on the given channel.
pub fn encode_text(message: &JupyterMessage, channel: Channel) -> Result<String, WireError> {
    let mut envelope = serde_json::to_value(OutboundEnvelope::new(message, channel))?;
    // Null metadata is rejected by some kernels
    if envelope["metadata"].is_null() {
        envelope["metadata"] = Value::Object(serde_json::Map::new());
    }
    Ok(envelope.to_string())
}

/// Decode a text frame into a message.
pub fn decode_text(text: &str) -> Result<JupyterMessage, WireError> {
    serde_json::from_str::<InboundEnvelope>(text)?.into_message(Vec::new())
}
