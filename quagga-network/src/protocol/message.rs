//! Logical messages and their framing.
//!
//! A message has a header (service id, message id, plus user header tags),
//! a body of further tag-value items, and the id of the connection it
//! arrived on. Messages whose body exceeds [`CHUNK_SIZE`] are transmitted
//! as a chunk sequence; [`MessageBuilder`] produces the per-chunk frames
//! and [`ParsedFrame`] is the receive-side view of one frame.

use bytes::{Bytes, BytesMut};

use crate::constants::{CHUNK_SIZE, MAX_MESSAGE_SIZE};
use crate::error::Error;

use super::tags::{self, header};

pub use super::tags::TagValue;

/// A logical message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// The service this message targets.
    pub service_id: u32,
    /// The message id within the service.
    pub message_id: u32,
    /// User header items (reserved tags excluded).
    pub headers: Vec<(u32, TagValue)>,
    /// The body: a sequence of tag-value items, kept opaque by the
    /// transport.
    pub body: Bytes,
    /// The connection the message arrived on, when received.
    pub remote: Option<i32>,
}

impl Message {
    pub fn new(service_id: u32, message_id: u32, body: Bytes) -> Message {
        Message {
            service_id,
            message_id,
            headers: Vec::new(),
            body,
            remote: None,
        }
    }

    /// Build a body from tag-value items.
    pub fn body_from_items(items: &[(u32, TagValue)]) -> Bytes {
        let mut buf = BytesMut::new();
        for (tag, value) in items {
            tags::put_item(&mut buf, *tag, value);
        }
        buf.freeze()
    }

    /// Parse the body back into tag-value items.
    pub fn body_items(&self) -> Result<Vec<(u32, TagValue)>, Error> {
        let mut bytes = self.body.clone();
        let mut items = Vec::new();
        while !bytes.is_empty() {
            items.push(tags::get_item(&mut bytes)?);
        }
        Ok(items)
    }

    /// Whether this message must be chunked for transmission.
    pub fn needs_chunking(&self) -> bool {
        self.body.len() > CHUNK_SIZE
    }
}

/// Builds wire frames (without the 2-byte length prefix; the codec adds
/// it).
pub struct MessageBuilder;

impl MessageBuilder {
    fn header_common(buf: &mut BytesMut, message: &Message) {
        tags::put_item(
            buf,
            header::SERVICE_ID,
            &TagValue::PositiveInt(message.service_id as u64),
        );
        tags::put_item(
            buf,
            header::MESSAGE_ID,
            &TagValue::PositiveInt(message.message_id as u64),
        );
        for (tag, value) in &message.headers {
            tags::put_item(buf, *tag, value);
        }
    }

    /// A single un-chunked frame carrying the whole message.
    pub fn build(message: &Message) -> Result<Bytes, Error> {
        if message.needs_chunking() {
            return Err(Error::Parse("message requires chunked transmission"));
        }
        let mut buf = BytesMut::with_capacity(message.body.len() + 64);
        Self::header_common(&mut buf, message);
        tags::put_item(&mut buf, header::HEADER_END, &TagValue::Bool(true));
        buf.extend_from_slice(&message.body);
        if buf.len() + 2 > MAX_MESSAGE_SIZE {
            return Err(Error::OversizedFrame);
        }
        Ok(buf.freeze())
    }

    /// The frames of a chunked transmission: the first carries
    /// `SequenceStart` with the total body length, every chunk carries
    /// `LastInSequence`, true only on the final one.
    pub fn build_chunked(message: &Message) -> Result<Vec<Bytes>, Error> {
        let total = message.body.len();
        let mut frames = Vec::with_capacity(total / CHUNK_SIZE + 1);
        let mut offset = 0usize;
        // The repeated middle-chunk header is identical; build it once and
        // reuse it.
        let mut middle_header: Option<Bytes> = None;
        while offset < total {
            let end = std::cmp::min(offset + CHUNK_SIZE, total);
            let first = offset == 0;
            let last = end == total;

            let header_bytes = if !first && !last && middle_header.is_some() {
                middle_header.clone().expect("checked above")
            } else {
                let mut buf = BytesMut::with_capacity(64);
                Self::header_common(&mut buf, message);
                if first {
                    tags::put_item(
                        &mut buf,
                        header::SEQUENCE_START,
                        &TagValue::PositiveInt(total as u64),
                    );
                }
                tags::put_item(&mut buf, header::LAST_IN_SEQUENCE, &TagValue::Bool(last));
                tags::put_item(&mut buf, header::HEADER_END, &TagValue::Bool(true));
                let bytes = buf.freeze();
                if !first && !last {
                    middle_header = Some(bytes.clone());
                }
                bytes
            };

            let mut frame = BytesMut::with_capacity(header_bytes.len() + (end - offset));
            frame.extend_from_slice(&header_bytes);
            frame.extend_from_slice(&message.body[offset..end]);
            if frame.len() + 2 > MAX_MESSAGE_SIZE {
                return Err(Error::OversizedFrame);
            }
            frames.push(frame.freeze());
            offset = end;
        }
        Ok(frames)
    }

    /// A bare system frame carrying one reserved header item.
    pub fn build_system(tag: u32, value: TagValue) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        tags::put_item(&mut buf, tag, &value);
        tags::put_item(&mut buf, header::HEADER_END, &TagValue::Bool(true));
        buf.freeze()
    }
}

/// The receive-side view of one frame's payload.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    pub service_id: Option<u32>,
    pub message_id: Option<u32>,
    pub sequence_start: Option<u64>,
    pub last_in_sequence: Option<bool>,
    pub ping: bool,
    pub pong: bool,
    pub headers: Vec<(u32, TagValue)>,
    pub body: Bytes,
    /// Whether the very first item was a positive-integer service id, as
    /// the protocol sniff requires of a peer's first frame.
    pub leads_with_service_id: bool,
}

impl ParsedFrame {
    /// Parse a frame payload (length prefix already stripped).
    pub fn parse(payload: Bytes) -> Result<ParsedFrame, Error> {
        let mut bytes = payload;
        let mut frame = ParsedFrame::default();
        let mut first = true;
        loop {
            if bytes.is_empty() {
                // A frame may be header-only (system traffic).
                return Ok(frame);
            }
            let (tag, value) = tags::get_item(&mut bytes)?;
            if first {
                frame.leads_with_service_id =
                    tag == header::SERVICE_ID && matches!(value, TagValue::PositiveInt(_));
                first = false;
            }
            match tag {
                header::SERVICE_ID => {
                    frame.service_id = Some(
                        value
                            .as_int()
                            .ok_or(Error::Parse("service id must be a positive int"))?
                            as u32,
                    )
                }
                header::MESSAGE_ID => {
                    frame.message_id = Some(
                        value
                            .as_int()
                            .ok_or(Error::Parse("message id must be a positive int"))?
                            as u32,
                    )
                }
                header::SEQUENCE_START => {
                    frame.sequence_start =
                        Some(value.as_int().ok_or(Error::Parse(
                            "sequence start must be a positive int",
                        ))?)
                }
                header::LAST_IN_SEQUENCE => match value {
                    TagValue::Bool(last) => frame.last_in_sequence = Some(last),
                    _ => return Err(Error::Parse("last-in-sequence must be a bool")),
                },
                header::PING => frame.ping = true,
                header::PONG => frame.pong = true,
                header::HEADER_END => {
                    frame.body = bytes;
                    return Ok(frame);
                }
                header::END => {}
                _ => frame.headers.push((tag, value)),
            }
        }
    }

    /// Convert a complete (un-chunked) frame into a message.
    pub fn into_message(self, remote: i32) -> Result<Message, Error> {
        Ok(Message {
            service_id: self.service_id.ok_or(Error::Parse("missing service id"))?,
            message_id: self.message_id.ok_or(Error::Parse("missing message id"))?,
            headers: self.headers,
            body: self.body,
            remote: Some(remote),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_a_frame() {
        quagga_test::init();

        let body = Message::body_from_items(&[(10, TagValue::Str("hello".into()))]);
        let mut message = Message::new(8, 3, body);
        message.headers.push((11, TagValue::PositiveInt(42)));

        let frame = MessageBuilder::build(&message).unwrap();
        let parsed = ParsedFrame::parse(frame).unwrap();
        assert!(parsed.leads_with_service_id);
        let received = parsed.into_message(7).unwrap();

        assert_eq!(received.service_id, 8);
        assert_eq!(received.message_id, 3);
        assert_eq!(received.headers, vec![(11, TagValue::PositiveInt(42))]);
        assert_eq!(received.body, message.body);
        assert_eq!(received.remote, Some(7));
    }

    #[test]
    fn chunked_frames_carry_sequence_markers() {
        quagga_test::init();

        let body = Bytes::from(vec![0xab; CHUNK_SIZE * 2 + 100]);
        let message = Message::new(8, 3, body.clone());
        let frames = MessageBuilder::build_chunked(&message).unwrap();
        assert_eq!(frames.len(), 3);

        let mut reassembled = BytesMut::new();
        for (index, frame) in frames.iter().enumerate() {
            let parsed = ParsedFrame::parse(frame.clone()).unwrap();
            assert_eq!(parsed.service_id, Some(8));
            if index == 0 {
                assert_eq!(parsed.sequence_start, Some(body.len() as u64));
            } else {
                assert_eq!(parsed.sequence_start, None);
            }
            assert_eq!(parsed.last_in_sequence, Some(index == frames.len() - 1));
            reassembled.extend_from_slice(&parsed.body);
        }
        assert_eq!(reassembled.freeze(), body);
    }

    #[test]
    fn oversized_single_frame_is_refused() {
        quagga_test::init();

        let message = Message::new(8, 3, Bytes::from(vec![0u8; CHUNK_SIZE + 1]));
        assert!(matches!(
            MessageBuilder::build(&message),
            Err(Error::Parse(_))
        ));
        assert!(MessageBuilder::build_chunked(&message).is_ok());
    }

    #[test]
    fn ping_frames_parse_as_system_traffic() {
        quagga_test::init();

        let frame = MessageBuilder::build_system(header::PING, TagValue::Bool(true));
        let parsed = ParsedFrame::parse(frame).unwrap();
        assert!(parsed.ping);
        assert!(!parsed.pong);
        assert!(parsed.service_id.is_none());
    }
}
