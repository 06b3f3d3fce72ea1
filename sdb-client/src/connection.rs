// SDB connection management
//
// Handles TCP connect/accept, handshake, version negotiation and event loop startup

use crate::commands::{command_sets, vm_commands, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use crate::eventloop::{spawn_event_loop, EventLoopHandle};
use crate::events::EventSet;
use crate::protocol::*;
use bytes::BufMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded retry for agents that are still starting up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SdbConnection {
    event_loop: EventLoopHandle,
    next_id: Arc<AtomicU32>,
}

impl SdbConnection {
    /// Connect to a debugger agent listening on `addr`
    pub async fn connect(addr: SocketAddr) -> SdbResult<Self> {
        info!("Connecting to SDB agent at {}", addr);

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Self::from_stream(stream).await
    }

    /// Connect, retrying while the agent is still starting up
    pub async fn connect_with_retry(
        addr: SocketAddr,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> SdbResult<Self> {
        let attempts = policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SdbError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SdbError::Cancelled),
                result = Self::connect(addr) => result,
            };

            match result {
                Ok(connection) => return Ok(connection),
                // A wrong handshake will not fix itself
                Err(SdbError::InvalidHandshake) => return Err(SdbError::InvalidHandshake),
                Err(e) => {
                    debug!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SdbError::Cancelled),
                    _ = tokio::time::sleep(policy.delay) => {}
                }
            }
        }

        Err(SdbError::Exhausted {
            attempts,
            last: last_error,
        })
    }

    /// Bind `addr` and wait for the agent to connect back
    pub async fn listen(addr: SocketAddr, cancel: &CancellationToken) -> SdbResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::accept(listener, cancel).await
    }

    /// Wait for an agent started with `server=n` to connect back to us
    pub async fn accept(listener: TcpListener, cancel: &CancellationToken) -> SdbResult<Self> {
        info!("Waiting for SDB agent on {}", listener.local_addr()?);

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Err(SdbError::Cancelled),
            accepted = listener.accept() => accepted?,
        };

        info!("SDB agent connected from {}", peer);
        stream.set_nodelay(true).ok();
        Self::from_stream(stream).await
    }

    /// Handshake over an established stream and start the event loop
    pub async fn from_stream<S>(mut stream: S) -> SdbResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::handshake(&mut stream).await?;

        let (reader, writer) = tokio::io::split(stream);
        let event_loop = spawn_event_loop(reader, writer);

        Ok(Self {
            event_loop,
            next_id: Arc::new(AtomicU32::new(1)),
        })
    }

    /// The agent speaks first; the debugger echoes the handshake back
    async fn handshake<S>(stream: &mut S) -> SdbResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Performing SDB handshake");

        let mut buf = vec![0u8; SDB_HANDSHAKE.len()];
        stream.read_exact(&mut buf).await?;

        if buf != SDB_HANDSHAKE {
            warn!("Invalid handshake from agent: {:?}", buf);
            return Err(SdbError::InvalidHandshake);
        }

        stream.write_all(SDB_HANDSHAKE).await?;
        stream.flush().await?;

        info!("SDB handshake successful");
        Ok(())
    }

    /// Tell the agent which protocol revision our packet layouts follow
    pub async fn negotiate_version(&self) -> SdbResult<()> {
        let version = self.get_version().await?;
        info!(
            "Agent '{}' speaks protocol {}.{}",
            version.vm_version, version.major, version.minor
        );

        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::VIRTUAL_MACHINE,
            vm_commands::SET_PROTOCOL_VERSION,
        );
        packet.data.put_i32(PROTOCOL_MAJOR);
        packet.data.put_i32(PROTOCOL_MINOR);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }

    /// Send a command and wait for reply
    pub async fn send_command(&self, packet: CommandPacket) -> SdbResult<ReplyPacket> {
        debug!("Sending command packet id={}", packet.id);
        self.event_loop.send_command(packet).await
    }

    /// Wait for the next event; None once the agent is gone
    pub async fn recv_event(&self) -> Option<EventSet> {
        self.event_loop.recv_event().await
    }

    pub fn is_closed(&self) -> bool {
        self.event_loop.is_closed()
    }

    /// Generate next packet ID
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::event_kinds;
    use crate::events::EventKind;
    use crate::testing::FakeAgent;

    #[tokio::test]
    async fn test_handshake_and_negotiation() {
        let (agent, addr) = FakeAgent::bind().await;

        let server = tokio::spawn(async move {
            let mut agent = agent.accept().await;

            let version = agent.read_command().await;
            assert_eq!(version.command, vm_commands::VERSION);
            let mut payload = Vec::new();
            crate::reader::put_string(&mut payload, "mono 6.12");
            payload.put_i32(2);
            payload.put_i32(58);
            agent.reply(version.id, &payload).await;

            let set = agent.read_command().await;
            assert_eq!(set.command, vm_commands::SET_PROTOCOL_VERSION);
            assert_eq!(set.data, vec![0, 0, 0, 2, 0, 0, 0, 12]);
            agent.reply(set.id, &[]).await;
        });

        let connection = SdbConnection::connect(addr).await.unwrap();
        connection.negotiate_version().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_composite_event_reaches_receiver() {
        let (agent, addr) = FakeAgent::bind().await;

        let server = tokio::spawn(async move {
            let mut agent = agent.accept().await;
            let mut payload = Vec::new();
            payload.put_u8(1); // suspend all
            payload.put_i32(1);
            payload.put_u8(event_kinds::THREAD_START);
            payload.put_i32(7);
            payload.put_u32(42);
            agent.send_events(&payload).await;
            agent
        });

        let connection = SdbConnection::connect(addr).await.unwrap();
        let set = connection.recv_event().await.unwrap();
        let _agent = server.await.unwrap();

        assert!(set.suspends());
        assert_eq!(set.events.len(), 1);
        let event = &set.events[0];
        assert_eq!(event.request_id, 7);
        assert_eq!(event.thread, 42);
        assert_eq!(event.details, EventKind::ThreadStart);
    }

    #[tokio::test]
    async fn test_bad_handshake_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"JDWP-Handshak").await.unwrap();
        });

        let result = SdbConnection::connect(addr).await;
        assert!(matches!(result, Err(SdbError::InvalidHandshake)));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(10),
        };
        let result = SdbConnection::connect_with_retry(addr, policy, &cancel).await;
        assert!(matches!(result, Err(SdbError::Exhausted { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn test_retry_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let result = SdbConnection::connect_with_retry(addr, RetryPolicy::default(), &cancel).await;
        assert!(matches!(result, Err(SdbError::Cancelled)));
    }

    #[tokio::test]
    async fn test_listen_accepts_agent() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let cancel = CancellationToken::new();
        let listening = tokio::spawn(async move { SdbConnection::listen(addr, &cancel).await });

        // The agent dials in and speaks first
        let mut agent = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        agent.write_all(SDB_HANDSHAKE).await.unwrap();
        let mut echo = vec![0u8; SDB_HANDSHAKE.len()];
        agent.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, SDB_HANDSHAKE);

        assert!(listening.await.unwrap().is_ok());
    }

    #[test]
    fn test_next_id() {
        let counter = AtomicU32::new(1);

        assert_eq!(counter.fetch_add(1, Ordering::SeqCst), 1);
        assert_eq!(counter.fetch_add(1, Ordering::SeqCst), 2);
    }
}
