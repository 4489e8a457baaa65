//! Length-delimited binary codec for replication streams.
//!
//! Wire format: 4-byte big-endian length prefix + frame body (see `frame`).
//! Each side decodes one frame direction and encodes the other.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{DownstreamFrame, UpstreamFrame, WireFrame};
use crate::{ProtocolError, MAX_FRAME_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Frames one direction in, the other direction out.
pub struct FrameCodec<In, Out> {
    max: usize,
    _dir: PhantomData<fn(Out) -> In>,
}

/// Used by the subscribing side: reads transactions, writes SUBSCRIBE / RECEIVED_UP_TO.
pub type SubscriberCodec = FrameCodec<DownstreamFrame, UpstreamFrame>;

/// Used by the source side: reads SUBSCRIBE / RECEIVED_UP_TO, writes transactions.
pub type SourceCodec = FrameCodec<UpstreamFrame, DownstreamFrame>;

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self::with_max(MAX_FRAME_BYTES)
    }

    pub fn with_max(max: usize) -> Self {
        Self {
            max,
            _dir: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: WireFrame, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(length).freeze();
        In::decode_body(body).map(Some)
    }
}

impl<In, Out: WireFrame> Encoder<Out> for FrameCodec<In, Out> {
    type Error = ProtocolError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Reserve the prefix, write the body in place, then patch the length.
        let start = dst.len();
        dst.put_u32(0);
        item.encode_body(dst)?;

        let length = dst.len() - start - LENGTH_PREFIX_SIZE;
        let prefix = match u32::try_from(length) {
            Ok(prefix) if length <= self.max => prefix,
            _ => {
                dst.truncate(start);
                return Err(ProtocolError::FrameTooLarge {
                    size: length,
                    max: self.max,
                });
            }
        };
        dst[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&prefix.to_be_bytes());
        Ok(())
    }
}
