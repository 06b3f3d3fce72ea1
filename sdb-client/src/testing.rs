// In-process stand-in for the Mono debugger agent

use crate::commands::{command_sets, event_commands};
use crate::protocol::{CommandPacket, HEADER_SIZE, REPLY_FLAG, SDB_HANDSHAKE};
use bytes::BufMut;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct FakeAgent {
    listener: TcpListener,
}

pub struct AgentSession {
    stream: TcpStream,
}

impl FakeAgent {
    pub async fn bind() -> (Self, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (Self { listener }, addr)
    }

    pub async fn accept(self) -> AgentSession {
        let (mut stream, _) = self.listener.accept().await.unwrap();
        stream.write_all(SDB_HANDSHAKE).await.unwrap();
        let mut echo = vec![0u8; SDB_HANDSHAKE.len()];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, SDB_HANDSHAKE);
        AgentSession { stream }
    }
}

impl AgentSession {
    pub async fn read_command(&mut self) -> CommandPacket {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header).await.unwrap();
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut full = header.to_vec();
        let mut body = vec![0u8; length - HEADER_SIZE];
        self.stream.read_exact(&mut body).await.unwrap();
        full.extend_from_slice(&body);
        CommandPacket::decode(&full).unwrap()
    }

    pub async fn reply(&mut self, id: u32, payload: &[u8]) {
        self.reply_with_code(id, 0, payload).await;
    }

    pub async fn reply_with_code(&mut self, id: u32, code: u16, payload: &[u8]) {
        let mut out = Vec::new();
        out.put_u32((HEADER_SIZE + payload.len()) as u32);
        out.put_u32(id);
        out.put_u8(REPLY_FLAG);
        out.put_u16(code);
        out.extend_from_slice(payload);
        self.stream.write_all(&out).await.unwrap();
    }

    pub async fn send_events(&mut self, payload: &[u8]) {
        let mut packet = CommandPacket::new(0, command_sets::EVENT, event_commands::COMPOSITE);
        packet.data.extend_from_slice(payload);
        self.stream.write_all(&packet.encode()).await.unwrap();
    }
}
