//! Per-client state and the shared write handle.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::codec::Writer;
use crate::error::Result;
use crate::packet::{ProtocolVersion, PublishPacket, Will};

/// Default Receive Maximum when the client announces none.
pub const DEFAULT_RECEIVE_MAXIMUM: u16 = 65_535;

/// Default Maximum Packet Size (the protocol maximum) when the client
/// announces none.
pub const DEFAULT_MAXIMUM_PACKET_SIZE: u32 = 268_435_455;

/// Default Topic Alias Maximum; aliases are disabled.
pub const DEFAULT_TOPIC_ALIAS_MAXIMUM: u16 = 0;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for the CONNECT packet.
    Connecting,
    /// CONNECT accepted.
    Connected,
}

/// Write side of a connection, shared with the subscription tree.
///
/// Any thread may deliver to a client by writing a fully framed packet
/// through this handle; the lock serializes concurrent senders. Matchers
/// never touch the driver-owned [`Client`] state.
pub struct ClientHandle {
    id: u64,
    addr: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl ClientHandle {
    /// `stream` is the cloned write half of the connection's socket.
    pub fn new(id: u64, stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            stream: Mutex::new(stream),
        }
    }

    /// Broker-assigned connection id.
    #[allow(dead_code)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[allow(dead_code)]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a framed packet onto the client's outgoing stream. Holding the
    /// lock across the write keeps packets from interleaving.
    pub fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(bytes)
    }

    /// Flush a connection's writer through the same lock as [`send`], so
    /// driver responses and cross-thread deliveries never interleave.
    ///
    /// [`send`]: ClientHandle::send
    pub fn flush_writer(&self, writer: &mut Writer) -> Result<()> {
        let mut stream = self.stream.lock();
        writer.write_to_stream(&mut *stream)
    }
}

/// A QoS 1/2 message awaiting acknowledgment.
#[derive(Debug, Clone)]
#[allow(dead_code)] // reserved for the QoS 1/2 flow
pub struct InflightPublish {
    pub publish: PublishPacket,
    pub sent_at: Instant,
}

/// Per-connection client record, owned by its connection driver.
#[allow(dead_code)] // session fields carried per the MQTT model, not all consumed yet
pub struct Client {
    pub id: u64,
    pub addr: SocketAddr,
    pub state: ClientState,
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    /// Keep alive in seconds; 0 disables the idle timeout.
    pub keep_alive: u16,
    pub session_expiry_interval: u32,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    /// Will message to publish on abnormal disconnect.
    pub will: Option<Will>,
    /// Whether the client sent a DISCONNECT packet.
    pub graceful_disconnect: bool,
    pub connect_time: Instant,
    pub last_activity: Instant,
    /// Topic filters this client subscribed to, for teardown.
    pub subscriptions: Vec<String>,
    /// Next packet id for outgoing QoS 1/2 messages (1..=65535, 0 skipped).
    pub next_packet_id: u16,
    /// Outgoing QoS 1/2 messages awaiting acknowledgment.
    #[allow(dead_code)] // reserved for the QoS 1/2 flow
    pub inflight: AHashMap<u16, InflightPublish>,
    pub receive_maximum: u16,
    pub maximum_packet_size: u32,
    pub topic_alias_maximum: u16,
}

impl Client {
    pub fn new(id: u64, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            state: ClientState::Connecting,
            client_id: String::new(),
            protocol_version: ProtocolVersion::V3_1_1,
            clean_start: true,
            keep_alive: 0,
            session_expiry_interval: 0,
            username: None,
            password: None,
            will: None,
            graceful_disconnect: false,
            connect_time: now,
            last_activity: now,
            subscriptions: Vec::new(),
            next_packet_id: 1,
            inflight: AHashMap::new(),
            receive_maximum: DEFAULT_RECEIVE_MAXIMUM,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            topic_alias_maximum: DEFAULT_TOPIC_ALIAS_MAXIMUM,
        }
    }

    /// Next available packet id, wrapping from 65535 to 1 (0 is invalid).
    #[allow(dead_code)] // reserved for the QoS 1/2 flow
    pub fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = id.checked_add(1).unwrap_or(1);
        id
    }
}
