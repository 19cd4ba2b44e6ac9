//! Stream framing for STUN/TURN over TCP.
//!
//! A TCP byte stream to a TURN server carries STUN messages
//! (`[2-byte type][2-byte length]...`, first two bits `00`) and ChannelData
//! messages (`[2-byte channel][2-byte length][data]`, first two bits `01`,
//! padded to 4 bytes over TCP). Anything else is a malformed frame.

use crate::error::{GatewayError, GatewayResult};
use crate::stun::{Message, HEADER_LEN};

/// One complete frame read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// STUN message plus its raw encoding (needed for integrity checks).
    Stun { message: Message, raw: Vec<u8> },
    ChannelData { channel: u16, data: Vec<u8> },
}

/// Total frame length announced by the first bytes of `buf`.
///
/// `Ok(None)` means more bytes are needed to tell.
pub fn frame_len(buf: &[u8]) -> GatewayResult<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    match buf[0] >> 6 {
        0b00 => {
            if len % 4 != 0 {
                return Err(GatewayError::MalformedFrame(format!(
                    "STUN length {len} is not a multiple of 4"
                )));
            }
            Ok(Some(HEADER_LEN + len))
        }
        0b01 => Ok(Some(4 + ((len + 3) & !3))),
        _ => Err(GatewayError::MalformedFrame(format!(
            "unexpected leading byte {:#04x}",
            buf[0]
        ))),
    }
}

/// Streaming decoder: accumulates bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct StunFrameDecoder {
    buffer: Vec<u8>,
}

impl StunFrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return every complete frame.
    ///
    /// A malformed frame is reported in place and the unparseable remainder
    /// of the buffer is discarded, since stream framing cannot resync.
    pub fn feed(&mut self, data: &[u8]) -> Vec<GatewayResult<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let total = match frame_len(&self.buffer) {
                Ok(Some(total)) => total,
                Ok(None) => break,
                Err(e) => {
                    frames.push(Err(e));
                    self.buffer.clear();
                    break;
                }
            };
            if self.buffer.len() < total {
                break;
            }

            let raw: Vec<u8> = self.buffer.drain(..total).collect();
            if raw[0] >> 6 == 0b01 {
                let channel = u16::from_be_bytes([raw[0], raw[1]]);
                let len = usize::from(u16::from_be_bytes([raw[2], raw[3]]));
                frames.push(Ok(Frame::ChannelData {
                    channel,
                    data: raw[4..4 + len].to_vec(),
                }));
                continue;
            }

            match Message::decode(&raw) {
                Ok(message) => frames.push(Ok(Frame::Stun { message, raw })),
                Err(e) => frames.push(Err(e)),
            }
        }

        frames
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
