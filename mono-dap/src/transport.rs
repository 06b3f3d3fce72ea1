// Content-Length framed transport
//
// The decoder yields raw JSON bodies so a malformed message can be dropped
// without tearing down the stream. Writes go through MessageSink, which
// stamps sequence numbers and serializes writers.

use crate::config::TraceLevel;
use crate::protocol::{Event, ProtocolMessage, Response};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::SinkExt;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, FramedWrite};
use tracing::{debug, info, warn};

const HEADER_END: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length:";

/// Largest message body accepted from a peer (10MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct DapCodec {
    content_length: Option<usize>,
    /// Body bytes of an oversized message still to be thrown away
    discard: usize,
}

impl DapCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
}

/// Parse the `Content-Length` line out of a header block
pub(crate) fn parse_content_length(header: &str) -> Option<usize> {
    header.lines().find_map(|line| {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();
        lower
            .strip_prefix(CONTENT_LENGTH)
            .and_then(|value| value.trim().parse::<usize>().ok())
    })
}

impl Decoder for DapCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(src.len());
                src.advance(n);
                self.discard -= n;
                if self.discard > 0 {
                    return Ok(None);
                }
                continue;
            }

            let length = match self.content_length {
                Some(length) => length,
                None => {
                    let Some(end) = find_header_end(src) else {
                        return Ok(None);
                    };

                    let header = src.split_to(end + HEADER_END.len());
                    let text = String::from_utf8_lossy(&header[..end]);

                    match parse_content_length(&text) {
                        Some(length) if length > MAX_MESSAGE_SIZE => {
                            warn!(
                                "Dropping message of {} bytes (max: {} bytes)",
                                length, MAX_MESSAGE_SIZE
                            );
                            self.discard = length;
                            continue;
                        }
                        Some(length) => {
                            self.content_length = Some(length);
                            length
                        }
                        None => {
                            warn!("Dropping header without Content-Length: {:?}", text);
                            continue;
                        }
                    }
                }
            };

            if src.len() < length {
                src.reserve(length - src.len());
                return Ok(None);
            }

            self.content_length = None;
            return Ok(Some(src.split_to(length).freeze()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    debug!("Discarding {} bytes of truncated input", buf.len());
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for DapCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item).map_err(io::Error::other)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct SinkState {
    writer: FramedWrite<BoxedWriter, DapCodec>,
    seq: i64,
}

/// Shared outbound half of a connection
#[derive(Clone)]
pub struct MessageSink {
    state: Arc<Mutex<SinkState>>,
    trace: TraceLevel,
}

impl MessageSink {
    pub fn new<W>(writer: W, trace: TraceLevel) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            state: Arc::new(Mutex::new(SinkState {
                writer: FramedWrite::new(writer, DapCodec::new()),
                seq: 0,
            })),
            trace,
        }
    }

    /// Stamp the next sequence number and write the message
    pub async fn send(&self, message: ProtocolMessage) -> i64 {
        self.send_with(message, |_| {}).await
    }

    /// Like `send`, running `before_write` with the assigned sequence number
    /// while no other message can be written
    pub async fn send_with<F>(&self, mut message: ProtocolMessage, before_write: F) -> i64
    where
        F: FnOnce(i64),
    {
        let mut state = self.state.lock().await;
        state.seq += 1;
        let seq = state.seq;
        message.set_seq(seq);
        before_write(seq);

        if let ProtocolMessage::Response(ref response) = message {
            if self.trace == TraceLevel::Responses {
                info!(
                    target: "mono_dap::trace",
                    "response: {}",
                    serde_json::to_string(response).unwrap_or_default()
                );
            }
        }

        // The peer may already be gone; nothing useful to do about it
        if let Err(e) = state.writer.send(message).await {
            debug!("Write to client failed: {}", e);
        }

        seq
    }

    pub async fn send_response(&self, response: Response) -> i64 {
        self.send(ProtocolMessage::Response(response)).await
    }

    pub async fn send_event<B: Serialize>(&self, event: &str, body: B) {
        let body = match serde_json::to_value(body) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("Cannot serialize '{}' event body: {}", event, e);
                None
            }
        };
        self.send(ProtocolMessage::Event(Event::new(event, body)))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_util::codec::FramedRead;

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(frame(r#"{"a":1}"#).as_bytes());
        buf.extend_from_slice(frame(r#"{"b":"é"}"#).as_bytes());

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &br#"{"a":1}"#[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            r#"{"b":"é"}"#.as_bytes()
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_body_waits_for_more() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"Content-Length: 10\r\n\r\n{\"seq\"");

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b":12}");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"{\"seq\":12}"[..]);
    }

    #[test]
    fn test_header_without_length_is_dropped() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"X-Junk: 1\r\n\r\n");
        buf.extend_from_slice(b"Content-Type: json\r\ncontent-length: 2\r\n\r\n{}");

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"{}"[..]);
    }

    #[test]
    fn test_huge_content_length_is_dropped() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"Content-Length: 18446744073709551615\r\n\r\n{}");

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_body_is_skipped() {
        let mut codec = DapCodec::new();
        let mut buf = BytesMut::new();
        let length = MAX_MESSAGE_SIZE + 1;
        buf.extend_from_slice(format!("Content-Length: {}\r\n\r\n", length).as_bytes());
        buf.extend_from_slice(&vec![b'x'; length / 2]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        // The rest of the body arrives together with a good message
        buf.extend_from_slice(&vec![b'x'; length - length / 2]);
        buf.extend_from_slice(frame(r#"{"ok":true}"#).as_bytes());
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            &br#"{"ok":true}"#[..]
        );
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length("Content-Length: 42"), Some(42));
        assert_eq!(parse_content_length("Foo: bar\r\nContent-Length:7"), Some(7));
        assert_eq!(parse_content_length("Content-Length: x"), None);
    }

    #[tokio::test]
    async fn test_sink_assigns_increasing_seq() {
        let (client, server) = tokio::io::duplex(4096);
        let sink = MessageSink::new(server, TraceLevel::Off);

        let first = sink
            .send(ProtocolMessage::Request(Request::new("threads", None)))
            .await;
        sink.send_event("initialized", json!({})).await;
        assert_eq!(first, 1);

        let mut frames = FramedRead::new(client, DapCodec::new());
        let one: ProtocolMessage =
            serde_json::from_slice(&frames.next().await.unwrap().unwrap()).unwrap();
        let two: ProtocolMessage =
            serde_json::from_slice(&frames.next().await.unwrap().unwrap()).unwrap();

        assert_eq!(one.seq(), 1);
        assert_eq!(two.seq(), 2);
        assert!(matches!(two, ProtocolMessage::Event(ref e) if e.event == "initialized"));
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_is_swallowed() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let sink = MessageSink::new(server, TraceLevel::Off);

        assert_eq!(sink.send_event("output", json!({"output": "x"})).await, ());
    }
}
