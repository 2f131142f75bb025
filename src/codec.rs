//! Framed length-prefixed codec used on every socket (hub, probe server,
//! rapp). Header layout: little-endian `{u64 partid, u32 length, u16 pid,
//! u8 tp, u8 checkbit}`, `checkbit == tp ^ 0xFF`, followed by `length` body
//! bytes. The body is msgpack unless the sender flags the package binary.

use crate::error::FrameError;
use serde::{de::DeserializeOwned, Serialize};

pub const HEADER_SIZE: usize = 16;

/// A single framed message. `body` is opaque bytes on the wire; callers
/// interpret it as msgpack via [`Package::read_data`] unless they know the
/// type is binary-flagged (e.g. `REQ_DATA`'s forwarded probe payload).
#[derive(Debug, Clone)]
pub struct Package {
    pub partid: u64,
    pub pid: u16,
    pub tp: u8,
    pub body: Vec<u8>,
}

impl Package {
    /// Build a package whose body is msgpack-encoded from `data`. Named
    /// struct fields are packed as a map (`to_vec_named`) so the hub and
    /// rapp sides — which read these as plain dicts — see field names;
    /// tuple structs such as [`crate::wire::AssetRecord`] and
    /// [`crate::wire::CheckEntry`] are unaffected and stay positional.
    pub fn make<T: Serialize>(tp: u8, data: &T) -> Result<Self, FrameError> {
        Ok(Package {
            partid: 0,
            pid: 0,
            tp,
            body: rmp_serde::to_vec_named(data)?,
        })
    }

    /// Build a package whose body is passed through unchanged (`is_binary`
    /// in the original).
    pub fn make_binary(tp: u8, body: Vec<u8>) -> Self {
        Package {
            partid: 0,
            pid: 0,
            tp,
            body,
        }
    }

    pub fn with_pid(mut self, pid: u16) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_partid(mut self, partid: u64) -> Self {
        self.partid = partid;
        self
    }

    /// Decode the body as msgpack. Panics-free; returns a [`FrameError`] on
    /// malformed msgpack rather than propagating a library panic.
    pub fn read_data<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(rmp_serde::from_slice(&self.body)?)
    }

    /// Serialize the full frame (header + body) for writing to a socket.
    pub fn to_bytes(&self) -> Vec<u8> {
        let length = self.body.len() as u32;
        let checkbit = self.tp ^ 0xFF;
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.partid.to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.push(self.tp);
        out.push(checkbit);
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a single frame from an exact-size buffer (header + body,
    /// nothing more, nothing less). Used by tests and by [`FrameDecoder`].
    fn from_exact(buf: &[u8]) -> Result<Self, FrameError> {
        let partid = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let length = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let pid = u16::from_le_bytes(buf[12..14].try_into().unwrap());
        let tp = buf[14];
        let checkbit = buf[15];
        if tp != checkbit ^ 0xFF {
            return Err(FrameError::BadCheckbit { tp, checkbit });
        }
        let body = buf[HEADER_SIZE..HEADER_SIZE + length as usize].to_vec();
        Ok(Package {
            partid,
            pid,
            tp,
            body,
        })
    }
}

/// Incremental decoder: buffers partial frames across `feed` calls and
/// yields whole packages. A malformed frame drains the entire buffer and
/// is logged — the caller must treat the next read as a resync point,
/// exactly as the spec requires.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append freshly-read bytes and drain as many complete frames as are
    /// now available. Never blocks.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Package> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }
            let length = u32::from_le_bytes(self.buf[8..12].try_into().unwrap()) as usize;
            let total = HEADER_SIZE + length;
            if self.buf.len() < total {
                break;
            }
            match Package::from_exact(&self.buf[..total]) {
                Ok(pkg) => {
                    out.push(pkg);
                    self.buf.drain(..total);
                }
                Err(e) => {
                    tracing::error!(error = %e, "frame decode error; dropping buffered bytes");
                    self.buf.clear();
                    break;
                }
            }
        }
        out
    }

    /// Clear any partially-buffered frame, e.g. on `connection_lost`.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: i64,
        b: String,
    }

    #[test]
    fn round_trip_msgpack_body() {
        let pkg = Package::make(0x01, &Sample { a: 7, b: "x".into() })
            .unwrap()
            .with_pid(42)
            .with_partid(9001);
        let bytes = pkg.to_bytes();

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&bytes);
        assert_eq!(decoded.len(), 1);
        let got = &decoded[0];
        assert_eq!(got.partid, 9001);
        assert_eq!(got.pid, 42);
        assert_eq!(got.tp, 0x01);
        let data: Sample = got.read_data().unwrap();
        assert_eq!(data, Sample { a: 7, b: "x".into() });
    }

    #[test]
    fn checkbit_is_tp_xor_0xff() {
        let pkg = Package::make_binary(0x05, vec![1, 2, 3]);
        let bytes = pkg.to_bytes();
        assert_eq!(bytes[14], 0x05);
        assert_eq!(bytes[15], 0x05 ^ 0xFF);
    }

    #[test]
    fn bad_checkbit_is_rejected_and_buffer_resyncs() {
        let pkg = Package::make_binary(0x05, vec![1, 2, 3]);
        let mut bytes = pkg.to_bytes();
        bytes[15] ^= 0x01; // flip one bit of the checkbit

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&bytes);
        assert!(decoded.is_empty());
        // buffer was drained; a subsequent well-formed frame decodes fine
        let good = Package::make_binary(0x02, vec![9]).to_bytes();
        let decoded = decoder.feed(&good);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].tp, 0x02);
    }

    #[test]
    fn partial_frame_is_buffered_until_complete() {
        let pkg = Package::make_binary(0x03, vec![1, 2, 3, 4, 5]);
        let bytes = pkg.to_bytes();
        let mut decoder = FrameDecoder::new();

        let first_half = decoder.feed(&bytes[..10]);
        assert!(first_half.is_empty());
        let rest = decoder.feed(&bytes[10..]);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].body, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn two_frames_in_one_feed() {
        let a = Package::make_binary(0x01, vec![1]).to_bytes();
        let b = Package::make_binary(0x02, vec![2, 2]).to_bytes();
        let mut combined = a.clone();
        combined.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&combined);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].tp, 0x01);
        assert_eq!(decoded[1].tp, 0x02);
    }
}
