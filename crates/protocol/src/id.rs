use std::fmt::{Debug, Display, Formatter};

use crate::error::Error;
use crate::message::CONNECTION_ID_LEN;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// The fixed-width opaque identifier that labels one flow across the START
/// handshake and subsequent data frames. Exactly the width the wire format
/// reserves: 36 ASCII bytes in GUID form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId([u8; CONNECTION_ID_LEN]);

impl ConnectionId {
    /// An all-zero id, used by the client before the server assigns one.
    pub fn zero() -> Self {
        Self([b'0'; CONNECTION_ID_LEN])
    }

    /// Generate a fresh random id in 8-4-4-4-12 form.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = match i {
                8 | 13 | 18 | 23 => b'-',
                _ => HEX[fastrand::usize(..16)],
            };
        }
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != CONNECTION_ID_LEN {
            return Err(Error::BadConnectionIdLength(CONNECTION_ID_LEN, bytes.len()));
        }

        let mut id = [0u8; CONNECTION_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; CONNECTION_ID_LEN] {
        &self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_guid_shaped() {
        let id = ConnectionId::generate();
        let bytes = id.as_bytes();

        assert_eq!(bytes.len(), CONNECTION_ID_LEN);
        for (i, b) in bytes.iter().enumerate() {
            match i {
                8 | 13 | 18 | 23 => assert_eq!(*b, b'-'),
                _ => assert!(b.is_ascii_hexdigit()),
            }
        }
    }

    #[test]
    fn from_slice_rejects_wrong_width() {
        assert!(ConnectionId::from_slice(&[b'a'; 35]).is_err());
        assert!(ConnectionId::from_slice(&[b'a'; 36]).is_ok());
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }
}
