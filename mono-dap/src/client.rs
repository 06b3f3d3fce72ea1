// Protocol client
//
// The requesting side of the protocol, for driving an adapter from tests and
// tools. Responses are matched to requests by `request_seq`, so they may
// arrive in any order. A timed out request marks the peer as stalled; new
// requests fail fast until the peer sends anything again.

use crate::config::TraceLevel;
use crate::protocol::{Event, ProtocolMessage, Request, Response};
use crate::transport::{DapCodec, MessageSink};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("peer is stalled, request '{0}' not sent")]
    Stalled(String),

    #[error("connection closed")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Pending = HashMap<i64, oneshot::Sender<Response>>;

#[derive(Default)]
struct Shared {
    pending: Mutex<Pending>,
    stalled: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ProtocolClient {
    sink: MessageSink,
    shared: Arc<Shared>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl ProtocolClient {
    /// Start reading `reader`; unsolicited events come out of the receiver
    pub fn new<R, W>(reader: R, writer: W) -> (Self, mpsc::Receiver<Event>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::default());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let reader = tokio::spawn(read_loop(reader, shared.clone(), events_tx));

        let client = Self {
            sink: MessageSink::new(writer, TraceLevel::Off),
            shared,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            reader,
        };
        (client, events_rx)
    }

    /// Talk to an adapter running in server mode
    pub async fn connect(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<Event>), ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_stalled(&self) -> bool {
        self.shared.stalled.load(Ordering::SeqCst)
    }

    /// Send `command` and wait for its response
    pub async fn request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Response, ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Disconnected);
        }
        if self.is_stalled() {
            return Err(ClientError::Stalled(command.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        let message = ProtocolMessage::Request(Request::new(command, arguments));

        // Register before the bytes leave so a fast response finds its waiter
        let seq = self
            .sink
            .send_with(message, move |seq| {
                if !shared.closed.load(Ordering::SeqCst) {
                    shared.pending().insert(seq, tx);
                }
            })
            .await;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.shared.pending().remove(&seq);
                self.shared.stalled.store(true, Ordering::SeqCst);
                warn!("Request '{}' (seq {}) timed out", command, seq);
                Err(ClientError::Timeout {
                    command: command.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Send `command` and decode the body of a successful response
    pub async fn request_body<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<T, ClientError> {
        let response = self.request(command, arguments).await?;
        let body = response.body.unwrap_or(Value::Null);
        Ok(serde_json::from_value(body)?)
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(reader: R, shared: Arc<Shared>, events: mpsc::Sender<Event>)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(reader, DapCodec::new());

    while let Some(frame) = framed.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Read from adapter failed: {}", e);
                break;
            }
        };

        // Any traffic means the peer is alive again
        shared.stalled.store(false, Ordering::SeqCst);

        match serde_json::from_slice::<ProtocolMessage>(&bytes) {
            Ok(ProtocolMessage::Response(response)) => {
                let waiter = shared.pending().remove(&response.request_seq);
                match waiter {
                    Some(waiter) => {
                        if waiter.send(response).is_err() {
                            debug!("Waiter for a response went away");
                        }
                    }
                    None => debug!(
                        "Unmatched response for request_seq {}",
                        response.request_seq
                    ),
                }
            }
            Ok(ProtocolMessage::Event(event)) => {
                if events.try_send(event).is_err() {
                    warn!("Event queue full or closed, dropping event");
                }
            }
            Ok(ProtocolMessage::Request(request)) => {
                debug!("Ignoring reverse request '{}'", request.command);
            }
            Err(e) => warn!("Ignoring malformed message: {}", e),
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails everyone still waiting
    shared.pending().clear();
}
