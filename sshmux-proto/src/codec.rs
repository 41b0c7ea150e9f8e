use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

/// Upper bound on any single `string` field. Nothing in the connection layer
/// legitimately approaches this; lengths beyond it are treated as framing
/// corruption rather than allocation requests.
pub const MAX_STRING_LEN: usize = 0x0800_0000;

/// A value that can be written to an outgoing packet.
pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);
}

/// A value that can be read from an incoming packet.
pub trait Decode: Sized {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;
}

/// Checked readers for the SSH wire primitives.
/// https://tools.ietf.org/html/rfc4251#section-5
pub trait SshBufExt: Buf {
    fn try_get_u8(&mut self) -> Result<u8, DecodeError> {
        if self.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        Ok(self.get_u8())
    }

    fn try_get_u32(&mut self) -> Result<u32, DecodeError> {
        if self.remaining() < 4 {
            return Err(DecodeError::Truncated);
        }
        Ok(self.get_u32())
    }

    fn try_get_bool(&mut self) -> Result<bool, DecodeError> {
        // RFC 4251 says any nonzero value is true, but the only values the
        // peer has business sending are 0 and 1; anything else is garbage.
        match SshBufExt::try_get_u8(self)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(DecodeError::InvalidBool(v)),
        }
    }
}

impl<B: Buf> SshBufExt for B {}

/// `string` readers, on `Bytes` so payloads can be taken without copying.
pub trait SshBytesExt {
    fn try_get_string(&mut self) -> Result<Bytes, DecodeError>;
    fn try_get_utf8(&mut self) -> Result<String, DecodeError>;
}

impl SshBytesExt for Bytes {
    fn try_get_string(&mut self) -> Result<Bytes, DecodeError> {
        let len = SshBufExt::try_get_u32(self)? as usize;
        if len > MAX_STRING_LEN {
            return Err(DecodeError::StringTooLong(len));
        }
        if self.remaining() < len {
            return Err(DecodeError::Truncated);
        }
        Ok(self.split_to(len))
    }

    fn try_get_utf8(&mut self) -> Result<String, DecodeError> {
        let raw = self.try_get_string()?;
        Ok(std::str::from_utf8(&raw)?.to_owned())
    }
}

/// Writers for the SSH wire primitives.
pub trait SshBufMutExt: BufMut {
    fn put_ssh_string(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_slice(data);
    }

    fn put_ssh_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }
}

impl<B: BufMut> SshBufMutExt for B {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let mut buf = BytesMut::new();
        buf.put_ssh_string(b"direct-tcpip");
        let mut bytes = buf.freeze();
        assert_eq!(bytes.try_get_utf8().unwrap(), "direct-tcpip");
        assert_eq!(bytes.remaining(), 0);
    }

    #[test]
    fn truncated_string_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"short");
        let mut bytes = buf.freeze();
        assert!(matches!(
            bytes.try_get_string(),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn absurd_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        let mut bytes = buf.freeze();
        assert!(matches!(
            bytes.try_get_string(),
            Err(DecodeError::StringTooLong(_))
        ));
    }

    #[test]
    fn bad_bool_rejected() {
        let mut bytes = Bytes::from_static(&[7]);
        assert!(matches!(
            bytes.try_get_bool(),
            Err(DecodeError::InvalidBool(7))
        ));
    }
}
