use bytes::{Buf, BufMut, BytesMut};

use crate::domain::{BrokerError, Result};

/// Serialized size of a `MessageHeader`. The fields occupy 14 bytes; the
/// frame is padded with 4 trailing zero bytes to the fixed 18.
pub const HEADER_SIZE: usize = 18;

const HEADER_PADDING: usize = 4;

/// Protocol version stamped on outbound envelopes.
pub const PROTOCOL_VERSION: &str = "1.00";

/// Fixed-size header of a socket envelope: 4 bytes ASCII version, u16
/// metadata length, u64 body length, big-endian. Position-independent and
/// decodable from exactly 18 bytes with no lookahead.
///
/// The decoder validates structure only; a version mismatch is not rejected.
/// That is a documented compatibility gap, not a feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    version: String,
    pub meta_size: u16,
    pub body_size: u64,
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            meta_size: 0,
            body_size: 0,
        }
    }
}

impl MessageHeader {
    pub fn new(meta_size: u16, body_size: u64) -> Self {
        Self {
            meta_size,
            body_size,
            ..Self::default()
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The version must be exactly 4 ASCII characters.
    pub fn set_version(&mut self, version: &str) -> Result<()> {
        if version.len() != 4 || !version.is_ascii() {
            return Err(BrokerError::InvalidVersion(version.to_string()));
        }
        self.version = version.to_string();
        Ok(())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_slice(self.version.as_bytes());
        buf.put_u16(self.meta_size);
        buf.put_u64(self.body_size);
        buf.put_bytes(0, HEADER_PADDING);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(BrokerError::InvalidHeader(format!(
                "need {HEADER_SIZE} bytes, got {}",
                buf.remaining()
            )));
        }
        let mut version = [0u8; 4];
        buf.copy_to_slice(&mut version);
        if !version.is_ascii() {
            return Err(BrokerError::InvalidHeader(
                "version bytes are not ASCII".to_string(),
            ));
        }
        let version = String::from_utf8_lossy(&version).into_owned();
        let meta_size = buf.get_u16();
        let body_size = buf.get_u64();
        buf.advance(HEADER_PADDING);
        Ok(Self {
            version,
            meta_size,
            body_size,
        })
    }
}
