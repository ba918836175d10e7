//! Length-prefixed frames: `u32le(len) || bincode(Message)`.

use crate::domain::errors::ReplicationError;
use crate::domain::messages::Message;

/// Largest frame body accepted from a remote.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

const PREFIX: usize = 4;

/// Encode one message as a frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, ReplicationError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ReplicationError::Codec(format!(
            "frame of {} bytes exceeds {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reassembles frames from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete message, if one is buffered.
    ///
    /// An oversized or undecodable frame is an error; the connection should
    /// be dropped since the stream can no longer be trusted to be aligned.
    pub fn next(&mut self) -> Result<Option<Message>, ReplicationError> {
        if self.buffer.len() < PREFIX {
            return Ok(None);
        }

        let mut len_bytes = [0u8; PREFIX];
        len_bytes.copy_from_slice(&self.buffer[..PREFIX]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ReplicationError::Codec(format!(
                "frame of {} bytes exceeds {}",
                len, MAX_FRAME_SIZE
            )));
        }
        if self.buffer.len() < PREFIX + len {
            return Ok(None);
        }

        let message = bincode::deserialize(&self.buffer[PREFIX..PREFIX + len])?;
        self.buffer.drain(..PREFIX + len);
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omega_core::ProofRequest;

    fn request() -> Message {
        Message::Request {
            channel: 1,
            id: 7,
            request: ProofRequest::block(0, 3, 2),
        }
    }

    #[test]
    fn test_split_frames_reassemble() {
        let mut bytes = encode_frame(&request()).unwrap();
        bytes.extend(
            encode_frame(&Message::Close {
                discovery_key: [4u8; 32],
            })
            .unwrap(),
        );

        let mut decoder = FrameDecoder::new();
        let (head, tail) = bytes.split_at(3);
        decoder.push(head);
        assert_eq!(decoder.next().unwrap(), None);

        decoder.push(tail);
        assert_eq!(decoder.next().unwrap(), Some(request()));
        assert!(matches!(decoder.next().unwrap(), Some(Message::Close { .. })));
        assert_eq!(decoder.next().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&u32::MAX.to_le_bytes());
        assert!(matches!(decoder.next(), Err(ReplicationError::Codec(_))));
    }

    #[test]
    fn test_garbage_body_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&3u32.to_le_bytes());
        decoder.push(&[0xff, 0xff, 0xff]);
        assert!(decoder.next().is_err());
    }
}
