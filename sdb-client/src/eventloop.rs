// SDB Event Loop
//
// Handles concurrent reading of events and replies from the agent socket

use crate::commands::{command_sets, event_commands};
use crate::events::{parse_event_packet, EventSet};
use crate::protocol::{CommandPacket, ReplyPacket, SdbError, SdbResult, HEADER_SIZE, REPLY_FLAG};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Maximum allowed SDB packet size (10MB)
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Request to send a command and get reply
pub struct CommandRequest {
    pub packet: CommandPacket,
    pub reply_tx: oneshot::Sender<SdbResult<ReplyPacket>>,
}

/// Handle to the event loop for sending commands and receiving events
#[derive(Clone, Debug)]
pub struct EventLoopHandle {
    command_tx: mpsc::Sender<CommandRequest>,
    event_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EventSet>>>,
}

impl EventLoopHandle {
    /// Send a command and wait for reply
    pub async fn send_command(&self, packet: CommandPacket) -> SdbResult<ReplyPacket> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let request = CommandRequest { packet, reply_tx };

        self.command_tx
            .send(request)
            .await
            .map_err(|_| SdbError::ConnectionClosed)?;

        reply_rx.await.map_err(|_| SdbError::ConnectionClosed)?
    }

    /// Wait for the next event; None once the agent connection is gone
    pub async fn recv_event(&self) -> Option<EventSet> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Start the event loop task
pub fn spawn_event_loop<R, W>(reader: R, writer: W) -> EventLoopHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(32);
    // Events are never dropped while the consumer keeps up
    let (event_tx, event_rx) = mpsc::channel(256);

    tokio::spawn(event_loop_task(reader, writer, command_rx, event_tx));

    EventLoopHandle {
        command_tx,
        event_rx: Arc::new(tokio::sync::Mutex::new(event_rx)),
    }
}

/// Main event loop task
async fn event_loop_task<R, W>(
    reader: R,
    mut writer: W,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    event_tx: mpsc::Sender<EventSet>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    info!("Event loop started");

    // Reads run in their own task so a partially read packet is never dropped
    let (packet_tx, mut packet_rx) = mpsc::channel(64);
    let reader_task = tokio::spawn(reader_task(reader, packet_tx));

    let mut pending_replies: HashMap<u32, oneshot::Sender<SdbResult<ReplyPacket>>> =
        HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("All connection handles dropped");
                    break;
                };
                let packet_id = cmd.packet.id;
                debug!(
                    "Sending command id={} set={} cmd={}",
                    packet_id, cmd.packet.command_set, cmd.packet.command
                );

                let encoded = cmd.packet.encode();
                if let Err(e) = writer.write_all(&encoded).await {
                    error!("Failed to write command: {}", e);
                    cmd.reply_tx.send(Err(SdbError::Io(e))).ok();
                    continue;
                }

                if let Err(e) = writer.flush().await {
                    error!("Failed to flush command: {}", e);
                    cmd.reply_tx.send(Err(SdbError::Io(e))).ok();
                    continue;
                }

                pending_replies.insert(packet_id, cmd.reply_tx);
            }

            packet = packet_rx.recv() => {
                match packet {
                    Some((true, packet_id, data)) => {
                        debug!("Received reply id={}", packet_id);

                        if let Some(tx) = pending_replies.remove(&packet_id) {
                            match ReplyPacket::decode(&data) {
                                Ok(reply) => {
                                    tx.send(Ok(reply)).ok();
                                }
                                Err(e) => {
                                    warn!("Failed to decode reply: {}", e);
                                    tx.send(Err(e)).ok();
                                }
                            }
                        } else {
                            warn!("Received reply for unknown command id={}", packet_id);
                        }
                    }
                    Some((false, _, data)) => {
                        dispatch_event_packet(&data, &event_tx);
                    }
                    None => break,
                }
            }
        }
    }

    reader_task.abort();
    for (_, tx) in pending_replies.drain() {
        tx.send(Err(SdbError::ConnectionClosed)).ok();
    }

    info!("Event loop shutting down");
}

async fn reader_task<R: AsyncRead + Unpin>(
    mut reader: R,
    packet_tx: mpsc::Sender<(bool, u32, Vec<u8>)>,
) {
    loop {
        match read_packet(&mut reader).await {
            Ok(packet) => {
                if packet_tx.send(packet).await.is_err() {
                    break;
                }
            }
            Err(SdbError::Io(ref io)) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("Agent closed the connection");
                break;
            }
            Err(e) => {
                error!("Failed to read packet: {}", e);
                break;
            }
        }
    }
}

fn dispatch_event_packet(data: &[u8], event_tx: &mpsc::Sender<EventSet>) {
    let packet = match CommandPacket::decode(data) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Failed to decode command packet: {}", e);
            return;
        }
    };

    if packet.command_set != command_sets::EVENT || packet.command != event_commands::COMPOSITE {
        warn!(
            "Ignoring agent command set={} cmd={}",
            packet.command_set, packet.command
        );
        return;
    }

    match parse_event_packet(&packet.data) {
        Ok(event_set) => {
            debug!(
                "Parsed event set: {} events, suspend_policy={}",
                event_set.events.len(),
                event_set.suspend_policy
            );

            match event_tx.try_send(event_set) {
                Ok(_) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    error!(
                        "Event channel full! Dropping event set with {} events",
                        event.events.len()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Event receiver dropped, future events will be discarded");
                }
            }
        }
        Err(e) => {
            warn!("Failed to parse event: {}", e);
        }
    }
}

/// Read a packet from the socket and determine if it's a reply or event
async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> SdbResult<(bool, u32, Vec<u8>)> {
    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.resize(HEADER_SIZE, 0);

    reader.read_exact(&mut header).await.map_err(SdbError::Io)?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let packet_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];

    if length < HEADER_SIZE {
        return Err(SdbError::Protocol(format!("Invalid packet length: {}", length)));
    }

    if length > MAX_PACKET_SIZE {
        return Err(SdbError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, MAX_PACKET_SIZE
        )));
    }

    let data_len = length - HEADER_SIZE;
    let mut full_packet = header.to_vec();

    if data_len > 0 {
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await.map_err(SdbError::Io)?;
        full_packet.extend_from_slice(&data);
    }

    Ok((flags == REPLY_FLAG, packet_id, full_packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tokio::io::duplex;

    fn reply(id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32((HEADER_SIZE + payload.len()) as u32);
        out.put_u32(id);
        out.put_u8(REPLY_FLAG);
        out.put_u16(0);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_out_of_order_replies_are_routed() {
        let (client, mut agent) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let handle = spawn_event_loop(reader, writer);

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send_command(CommandPacket::new(1, 1, 1)).await })
        };
        let second = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send_command(CommandPacket::new(2, 1, 2)).await })
        };

        let mut sent = [0u8; HEADER_SIZE * 2];
        agent.read_exact(&mut sent).await.unwrap();

        agent.write_all(&reply(2, &[0xbb])).await.unwrap();
        agent.write_all(&reply(1, &[0xaa])).await.unwrap();

        assert_eq!(first.await.unwrap().unwrap().data(), &[0xaa]);
        assert_eq!(second.await.unwrap().unwrap().data(), &[0xbb]);
    }

    #[tokio::test]
    async fn test_pending_fails_when_agent_goes_away() {
        let (client, mut agent) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let handle = spawn_event_loop(reader, writer);

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send_command(CommandPacket::new(1, 1, 1)).await })
        };

        let mut sent = [0u8; HEADER_SIZE];
        agent.read_exact(&mut sent).await.unwrap();
        drop(agent);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SdbError::ConnectionClosed)));
        assert!(handle.recv_event().await.is_none());
    }
}
