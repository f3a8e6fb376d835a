//! Wire codec: length-prefixed msgpack frames.
//!
//! Each frame is a 4-byte big-endian length followed by the msgpack
//! encoding of the message's JSON object form. The decoder is
//! incremental: feed it arbitrary byte chunks, pull out whole
//! messages.

use crate::error::ProtocolError;
use crate::msg::Msg;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

const LEN_PREFIX: usize = 4;

/// Upper bound on a single frame; anything larger is a corrupt or
/// hostile stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn encode(msg: &Msg) -> Result<Bytes, ProtocolError> {
    let value = msg.to_value();
    let payload =
        rmp_serde::to_vec_named(&value).map_err(|e| ProtocolError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::Codec(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }

    let mut out = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(&payload);
    Ok(out.freeze())
}

/// Incremental frame decoder. One per transport stream, owned by its
/// reader thread.
#[derive(Default)]
pub struct MsgDecoder {
    buf: BytesMut,
}

impl MsgDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete message, or `None` if more bytes are needed.
    pub fn next(&mut self) -> Result<Option<Msg>, ProtocolError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::Codec(format!("frame too large: {len} bytes")));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX);
        let payload = self.buf.split_to(len);

        let value: Value =
            rmp_serde::from_slice(&payload).map_err(|e| ProtocolError::Codec(e.to_string()))?;
        let msg = Msg::from_value(&value).map_err(ProtocolError::Codec)?;
        Ok(Some(msg))
    }

    /// Drain every complete message currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Msg>, ProtocolError> {
        let mut out = Vec::new();
        while let Some(msg) = self.next()? {
            out.push(msg);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Loc, StatusCode};

    #[test]
    fn split_feed_reassembles() {
        let mut a = Msg::cmd("first");
        a.ensure_cmd_id();
        a.dests = vec![Loc::app("mem://b:1/")];
        let b = Msg::result_from(StatusCode::Error, &a).with_detail("boom");

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode(&a).unwrap());
        wire.extend_from_slice(&encode(&b).unwrap());

        let mut dec = MsgDecoder::new();
        // Feed byte by byte to exercise partial-frame paths.
        let mut got = Vec::new();
        for byte in wire.iter() {
            dec.feed(std::slice::from_ref(byte));
            got.extend(dec.drain().unwrap());
        }

        assert_eq!(got.len(), 2);
        assert_eq!(got[0], a);
        assert_eq!(got[1], b);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut dec = MsgDecoder::new();
        let bogus = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        dec.feed(&bogus);
        assert!(dec.next().is_err());
    }

    #[test]
    fn garbage_payload_is_a_codec_error() {
        let mut dec = MsgDecoder::new();
        dec.feed(&4u32.to_be_bytes());
        dec.feed(&[0xc1, 0xc1, 0xc1, 0xc1]);
        assert!(dec.next().is_err());
    }
}
