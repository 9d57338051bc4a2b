//! Binary frame layout for messages that carry buffers.
//!
//! ```text
//! [u32 BE: n = number of parts]
//! [n x u32 BE: byte offset of each part]
//! [part 0: JSON envelope] [part 1..n: binary buffers]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use jupyter_protocol::{Channel, JupyterMessage};

use crate::message::{InboundEnvelope, WireError, OutboundEnvelope};

fn read_u32(data: &[u8], at: usize) -> Result<usize, WireError> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| WireError::MalformedFrame(format!("truncated offset table at {}", at)))
}

/// Decode a binary frame into a message with its buffers attached.
pub fn decode_binary(data: &[u8]) -> Result<JupyterMessage, WireError> {
    let parts = read_u32(data, 0)?;
    if parts == 0 {
        return Err(WireError::MalformedFrame("frame has no parts".into()));
    }

    let mut offsets = Vec::with_capacity(parts + 1);
    for i in 0..parts {
        offsets.push(read_u32(data, 4 * (i + 1))?);
    }
    offsets.push(data.len());

    for window in offsets.windows(2) {
        if window[0] > window[1] || window[1] > data.len() {
            return Err(WireError::MalformedFrame(format!(
                "offset {} out of range",
                window[0]
            )));
        }
    }

    let envelope: InboundEnvelope = serde_json::from_slice(&data[offsets[0]..offsets[1]])?;
    let buffers = offsets[1..]
        .windows(2)
        .map(|w| Bytes::copy_from_slice(&data[w[0]..w[1]]))
        .collect();

    envelope.into_message(buffers)
}

/// Encode a message and its buffers into a binary frame.
pub fn encode_binary(message: &JupyterMessage, channel: Channel) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(&OutboundEnvelope::new(message, channel))?;
    let parts = 1 + message.buffers.len();
    let header_len = 4 * (parts + 1);

    let mut offsets = Vec::with_capacity(parts);
    let mut cursor = header_len;
    offsets.push(cursor);
    cursor += json.len();
    for buffer in &message.buffers {
        offsets.push(cursor);
        cursor += buffer.len();
    }

    let mut out = BytesMut::with_capacity(cursor);
    out.put_u32(parts as u32);
    for offset in offsets {
        out.put_u32(offset as u32);
    }
    out.put_slice(&json);
    for buffer in &message.buffers {
        out.put_slice(buffer);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_frame_carries_buffers() {
        let mut message: JupyterMessage = jupyter_protocol::KernelInfoRequest::default().into();
        message.buffers = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"")];

        let frame = encode_binary(&message, Channel::Shell).unwrap();
        let decoded = decode_binary(&frame).unwrap();

        assert_eq!(decoded.header.msg_id, message.header.msg_id);
        assert_eq!(decoded.buffers.len(), 2);
        assert_eq!(&decoded.buffers[0][..], b"abc");
        assert!(decoded.buffers[1].is_empty());
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let err = decode_binary(&[0, 0, 0, 3, 0, 0]).unwrap_err();
        assert!(matches!(err, WireError::MalformedFrame(_)));
    }

    #[test]
    fn test_out_of_range_offset_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.extend_from_slice(&100u32.to_be_bytes());
        let err = decode_binary(&frame).unwrap_err();
        assert!(matches!(err, WireError::MalformedFrame(_)));
    }
}
