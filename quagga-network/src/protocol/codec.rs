//! A Tokio codec mapping byte streams to frame payloads and vice versa.
//!
//! Each frame begins with a 2-byte little-endian length that counts itself;
//! the rest is the payload handed to [`ParsedFrame`]. Frames longer than
//! the maximum message size drop the connection.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::{MAX_MESSAGE_SIZE, RECEIVE_STREAM_SIZE};
use crate::error::Error;

/// A codec which produces frame payloads from byte streams and vice versa.
pub struct Codec {
    builder: Builder,
    state: DecodeState,
}

/// A builder for specifying [`Codec`] options.
pub struct Builder {
    /// The maximum allowable frame length, length prefix included.
    max_len: usize,
    /// An optional label to use for reporting metrics.
    metrics_label: Option<String>,
}

impl Codec {
    /// Return a builder for constructing a [`Codec`].
    pub fn builder() -> Builder {
        Builder {
            max_len: MAX_MESSAGE_SIZE,
            metrics_label: None,
        }
    }
}

impl Builder {
    /// Finalize the builder and return a [`Codec`].
    pub fn finish(self) -> Codec {
        Codec {
            builder: self,
            state: DecodeState::Head,
        }
    }

    /// Configure the codec's maximum accepted frame size, in bytes.
    #[allow(dead_code)]
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_len = len;
        self
    }

    /// Configure the codec for the given peer address.
    pub fn with_metrics_label(mut self, metrics_label: String) -> Self {
        self.metrics_label = Some(metrics_label);
        self
    }
}

enum DecodeState {
    Head,
    Body { body_len: usize },
}

impl fmt::Debug for DecodeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeState::Head => write!(f, "DecodeState::Head"),
            DecodeState::Body { body_len } => f
                .debug_struct("DecodeState::Body")
                .field("body_len", &body_len)
                .finish(),
        }
    }
}

impl Encoder<Bytes> for Codec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = payload
            .len()
            .checked_add(2)
            .ok_or(Error::OversizedFrame)?;
        if total > self.builder.max_len {
            return Err(Error::OversizedFrame);
        }
        if let Some(label) = self.builder.metrics_label.clone() {
            metrics::counter!("bytes.written", total as u64, "addr" => label);
        }
        dst.reserve(total);
        dst.put_u16_le(total as u16);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for Codec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            DecodeState::Head => {
                if src.len() < 2 {
                    // Not enough data to read the length prefix.
                    src.reserve(RECEIVE_STREAM_SIZE);
                    return Ok(None);
                }
                let total = LittleEndian::read_u16(&src[0..2]) as usize;
                if total > self.builder.max_len {
                    return Err(Error::OversizedFrame);
                }
                if total < 2 {
                    return Err(Error::Parse("frame length below its own prefix"));
                }
                src.advance(2);
                let body_len = total - 2;
                self.state = DecodeState::Body { body_len };
                self.decode(src)
            }
            DecodeState::Body { body_len } => {
                if src.len() < body_len {
                    return Ok(None);
                }
                if let Some(label) = self.builder.metrics_label.clone() {
                    metrics::counter!("bytes.read", (body_len + 2) as u64, "addr" => label);
                }
                let payload = src.split_to(body_len).freeze();
                self.state = DecodeState::Head;
                Ok(Some(payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Vec<u8>) -> Option<Bytes> {
        let mut codec = Codec::builder().finish();
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from(payload), &mut wire)
            .expect("payload fits");
        let mut codec = Codec::builder().finish();
        codec.decode(&mut wire).expect("frame parses")
    }

    #[test]
    fn frames_round_trip() {
        quagga_test::init();

        let payload = vec![1u8, 2, 3, 4, 5];
        assert_eq!(roundtrip(payload.clone()).unwrap(), Bytes::from(payload));
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        quagga_test::init();

        let mut codec = Codec::builder().finish();
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from(vec![9u8; 100]), &mut wire)
            .unwrap();

        let mut partial = BytesMut::from(&wire[..50]);
        let mut codec = Codec::builder().finish();
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&wire[50..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap().unwrap(),
            Bytes::from(vec![9u8; 100])
        );
    }

    #[test]
    fn frame_size_boundary() {
        quagga_test::init();

        // A frame of exactly the maximum size is accepted.
        assert!(roundtrip(vec![0u8; MAX_MESSAGE_SIZE - 2]).is_some());

        // One byte more is refused on encode...
        let mut codec = Codec::builder().finish();
        let mut wire = BytesMut::new();
        assert!(matches!(
            codec.encode(Bytes::from(vec![0u8; MAX_MESSAGE_SIZE - 1]), &mut wire),
            Err(Error::OversizedFrame)
        ));

        // ...and a forged length prefix of 9001 drops the connection.
        let mut wire = BytesMut::new();
        wire.put_u16_le((MAX_MESSAGE_SIZE + 1) as u16);
        wire.extend_from_slice(&[0u8; 32]);
        let mut codec = Codec::builder().finish();
        assert!(matches!(
            codec.decode(&mut wire),
            Err(Error::OversizedFrame)
        ));
    }
}
