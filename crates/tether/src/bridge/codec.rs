//! Framed codec for the coordinator/worker channel.
//!
//! Wire format: a 4-byte big-endian length, then that many bytes of JSON.
//!
//! Framing errors and JSON errors are kept apart. A body that doesn't parse is
//! yielded in-band as `Err`, so the reader can log it and keep going. Only
//! I/O errors and oversized frames end the stream, since after those the
//! byte stream can't be resynchronized.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    max_frame_bytes: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_BYTES)
                .max_frame_length(max_frame_bytes)
                .new_codec(),
            max_frame_bytes,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, serde_json::Error>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        let Some(body) = self.frames.decode(src)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&body)))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> io::Result<()> {
        let start = dst.len();
        dst.put_u32(0);
        if let Err(e) = serde_json::to_writer((&mut *dst).writer(), &item) {
            dst.truncate(start);
            return Err(e.into());
        }

        let body_len = dst.len() - start - LENGTH_PREFIX_BYTES;
        if body_len > self.max_frame_bytes {
            dst.truncate(start);
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {body_len} bytes exceeds limit of {}",
                    self.max_frame_bytes
                ),
            ));
        }
        if body_len > LARGE_FRAME_BYTES {
            tracing::debug!(frame_kb = body_len / 1024, "Encoding large frame");
        }

        let prefix = u32::try_from(body_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        dst[start..start + LENGTH_PREFIX_BYTES].copy_from_slice(&prefix.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Frame;

    fn raw_frame(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn frames_decode_in_order() {
        let mut codec = JsonCodec::<Frame>::new();
        let mut buf = BytesMut::new();

        codec.encode(Frame::Initialize, &mut buf).unwrap();
        codec
            .encode(
                Frame::JsonRpc {
                    data: "{}".to_string(),
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().unwrap(),
            Frame::Initialize
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().unwrap(),
            Frame::JsonRpc {
                data: "{}".to_string()
            }
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn prefix_is_big_endian_body_length() {
        let mut codec = JsonCodec::<Frame>::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::Initialize, &mut buf).unwrap();

        let body = br#"{"topic":"initialize"}"#;
        assert_eq!(&buf[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], body);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Frame>::new();
        let mut full = BytesMut::new();
        codec.encode(Frame::Initialize, &mut full).unwrap();

        let rest = full.split_off(full.len() - 2);
        assert!(codec.decode(&mut full).unwrap().is_none());

        full.unsplit(rest);
        assert_eq!(
            codec.decode(&mut full).unwrap().unwrap().unwrap(),
            Frame::Initialize
        );
    }

    #[test]
    fn malformed_body_is_reported_in_band() {
        let mut codec = JsonCodec::<Frame>::new();
        let mut buf = raw_frame(b"abc");
        buf.unsplit(raw_frame(br#"{"topic":"gossip"}"#));
        codec.encode(Frame::Initialize, &mut buf).unwrap();

        assert!(codec.decode(&mut buf).unwrap().unwrap().is_err());
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_err());
        // The stream stays in sync after bad bodies.
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().unwrap(),
            Frame::Initialize
        );
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = JsonCodec::<Frame>::with_max_frame_bytes(16);
        let mut buf = BytesMut::from(&b"keep"[..]);
        let big = Frame::JsonRpc {
            data: "x".repeat(64),
        };

        let err = codec.encode(big.clone(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(&buf[..], b"keep");

        let mut incoming = raw_frame(serde_json::to_string(&big).unwrap().as_bytes());
        assert!(codec.decode(&mut incoming).is_err());
    }
}
