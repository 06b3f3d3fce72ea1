// Request dispatch loop
//
// Reads framed messages from the client and hands each request to a
// handler. The response goes out first, then whatever events the handler
// queued. Between requests the loop also drains the handler's background
// events (engine stops, debuggee output).

use crate::config::TraceLevel;
use crate::error::RequestError;
use crate::protocol::{Event, ProtocolMessage, Response};
use crate::transport::{DapCodec, MessageSink};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Collects the outcome of one request
#[derive(Debug, Default)]
pub struct Responder {
    body: Option<Value>,
    error: Option<RequestError>,
    events: Vec<(String, Option<Value>)>,
}

impl Responder {
    pub fn set_body<B: Serialize>(&mut self, body: B) {
        match serde_json::to_value(body) {
            Ok(body) => self.body = Some(body),
            Err(e) => warn!("Cannot serialize response body: {}", e),
        }
    }

    pub fn set_error(&mut self, error: RequestError) {
        self.error = Some(error);
    }

    /// Send `event` right after the response
    pub fn queue_event(&mut self, event: impl Into<String>, body: Option<Value>) {
        self.events.push((event.into(), body));
    }

    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    fn into_response(
        self,
        request_seq: i64,
        command: String,
    ) -> (Response, Vec<(String, Option<Value>)>) {
        let response = match self.error {
            Some(error) => Response {
                seq: 0,
                request_seq,
                success: false,
                command,
                message: Some(error.message()),
                body: serde_json::to_value(&error)
                    .ok()
                    .map(|error| json!({ "error": error })),
            },
            None => Response {
                seq: 0,
                request_seq,
                success: true,
                command,
                message: None,
                body: self.body,
            },
        };
        (response, self.events)
    }
}

/// One client's worth of request handling
pub trait RequestHandler: Send {
    type Event: Send;

    fn handle_request(
        &mut self,
        command: &str,
        arguments: Option<Value>,
        responder: &mut Responder,
    ) -> impl Future<Output = ()> + Send;

    /// Wait for the next background event; must be cancel safe
    fn next_event(&mut self) -> impl Future<Output = Option<Self::Event>> + Send;

    fn handle_event(&mut self, event: Self::Event) -> impl Future<Output = ()> + Send;

    /// True once the client asked us to go away
    fn is_finished(&self) -> bool;

    /// Release the debuggee when the client vanishes without disconnecting
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// Serve one client until it disconnects or the handler is finished
pub async fn serve<R, H>(reader: R, sink: MessageSink, handler: &mut H, trace: TraceLevel)
where
    R: AsyncRead + Unpin + Send,
    H: RequestHandler,
{
    let mut framed = FramedRead::new(reader, DapCodec::new());
    let mut events_open = true;

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(bytes)) => {
                    dispatch(&bytes, &sink, handler, trace).await;
                    if handler.is_finished() {
                        debug!("Handler finished, closing connection");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("Read from client failed: {}", e);
                    break;
                }
                None => {
                    info!("Client disconnected");
                    break;
                }
            },
            event = handler.next_event(), if events_open => match event {
                Some(event) => handler.handle_event(event).await,
                None => events_open = false,
            },
        }
    }

    handler.shutdown().await;
}

async fn dispatch<H: RequestHandler>(
    bytes: &[u8],
    sink: &MessageSink,
    handler: &mut H,
    trace: TraceLevel,
) {
    let message: ProtocolMessage = match serde_json::from_slice(bytes) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring malformed message: {}", e);
            return;
        }
    };

    let request = match message {
        ProtocolMessage::Request(request) => request,
        ProtocolMessage::Response(response) => {
            debug!(
                "Ignoring '{}' response from client (request_seq {})",
                response.command, response.request_seq
            );
            return;
        }
        ProtocolMessage::Event(event) => {
            debug!("Ignoring '{}' event from client", event.event);
            return;
        }
    };

    if trace.requests() {
        info!(
            target: "mono_dap::trace",
            "request: {}",
            String::from_utf8_lossy(bytes)
        );
    }

    let mut responder = Responder::default();
    handler
        .handle_request(&request.command, request.arguments, &mut responder)
        .await;

    if let Some(error) = responder.error() {
        debug!("'{}' failed: {}", request.command, error);
    }

    let (response, events) = responder.into_response(request.seq, request.command);
    sink.send_response(response).await;
    for (event, body) in events {
        sink.send(ProtocolMessage::Event(Event::new(event, body))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, AsyncWriteExt};

    struct EchoHandler {
        finished: bool,
    }

    impl RequestHandler for EchoHandler {
        type Event = ();

        async fn handle_request(
            &mut self,
            command: &str,
            arguments: Option<Value>,
            responder: &mut Responder,
        ) {
            match command {
                "echo" => {
                    responder.set_body(arguments);
                    responder.queue_event("echoed", None);
                }
                "bye" => self.finished = true,
                _ => responder.set_error(RequestError::unrecognized_request(command)),
            }
        }

        async fn next_event(&mut self) -> Option<()> {
            None
        }

        async fn handle_event(&mut self, _event: ()) {}

        fn is_finished(&self) -> bool {
            self.finished
        }

        async fn shutdown(&mut self) {}
    }

    fn frame(request: Request) -> Vec<u8> {
        let body = serde_json::to_vec(&ProtocolMessage::Request(request)).unwrap();
        let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        framed.extend(body);
        framed
    }

    #[tokio::test]
    async fn test_response_precedes_queued_events() {
        let (mut client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let sink = MessageSink::new(server_write, TraceLevel::Off);

        let task = tokio::spawn(async move {
            let mut handler = EchoHandler { finished: false };
            serve(server_read, sink, &mut handler, TraceLevel::Requests).await;
        });

        let mut request = Request::new("echo", Some(json!({"x": 1})));
        request.seq = 7;
        let mut bytes = frame(request);
        let mut bye = Request::new("bye", None);
        bye.seq = 8;
        // Two requests in one write
        bytes.extend(frame(bye));
        client.write_all(&bytes).await.unwrap();

        let (client_read, _client_write) = tokio::io::split(client);
        let mut framed = FramedRead::new(client_read, DapCodec::new());
        let messages = read_messages_split(&mut framed, 3).await;

        match &messages[0] {
            ProtocolMessage::Response(response) => {
                assert_eq!(response.request_seq, 7);
                assert!(response.success);
                assert_eq!(response.body, Some(json!({"x": 1})));
                assert_eq!(response.seq, 1);
            }
            other => panic!("expected response, got {:?}", other),
        }
        match &messages[1] {
            ProtocolMessage::Event(event) => {
                assert_eq!(event.event, "echoed");
                assert_eq!(event.seq, 2);
            }
            other => panic!("expected event, got {:?}", other),
        }
        match &messages[2] {
            ProtocolMessage::Response(response) => assert_eq!(response.request_seq, 8),
            other => panic!("expected response, got {:?}", other),
        }

        task.await.unwrap();
    }

    async fn read_messages_split(
        framed: &mut FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, DapCodec>,
        count: usize,
    ) -> Vec<ProtocolMessage> {
        let mut messages = Vec::new();
        for _ in 0..count {
            let bytes: Bytes = framed.next().await.unwrap().unwrap();
            messages.push(serde_json::from_slice(&bytes).unwrap());
        }
        messages
    }

    #[tokio::test]
    async fn test_unknown_command_is_an_error_response() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let sink = MessageSink::new(server_write, TraceLevel::Off);

        tokio::spawn(async move {
            let mut handler = EchoHandler { finished: false };
            serve(server_read, sink, &mut handler, TraceLevel::Off).await;
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        // Garbage is skipped, the loop keeps going
        client_write
            .write_all(b"Content-Length: 5\r\n\r\nnope!")
            .await
            .unwrap();
        let mut request = Request::new("frobnicate", None);
        request.seq = 3;
        client_write.write_all(&frame(request)).await.unwrap();

        let mut framed = FramedRead::new(client_read, DapCodec::new());
        let messages = read_messages_split(&mut framed, 1).await;

        match &messages[0] {
            ProtocolMessage::Response(response) => {
                assert!(!response.success);
                assert_eq!(response.request_seq, 3);
                assert_eq!(
                    response.message.as_deref(),
                    Some("unrecognized request: frobnicate")
                );
                assert_eq!(response.body.as_ref().unwrap()["error"]["id"], 1014);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}
