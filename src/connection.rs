//! Per-connection driver loop.
//!
//! Each accepted connection gets one thread running [`Connection::run`]:
//! read into the input buffer, frame whole packets, dispatch by command,
//! serialize the response through the writer, repeat. Multiple packets may
//! coalesce in a single read and a single packet may arrive fragmented
//! across reads; the buffer accumulates until a complete frame is
//! available and is compacted after each consumed packet.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use log::{debug, info, warn};

use crate::client::{Client, ClientHandle, ClientState};
use crate::codec::{decode_variable_int, Reader, Writer};
use crate::config::Config;
use crate::connect::{self, ConnectPacket};
use crate::error::{Error, ProtocolError, Result};
use crate::packet::{
    self, reason_code, Command, PublishPacket, QoS, SubscribePacket, SubscriptionOptions,
    UnsubscribePacket,
};
use crate::shared::{RetainedMessage, SharedStateHandle};
use crate::subscription::{topic_matches_filter, Subscriber};

/// Initial read buffer size.
const INITIAL_BUFFER_SIZE: usize = 1024;

/// Idle cutoff: 1.5 x keep alive.
fn keep_alive_timeout(keep_alive: u16) -> Duration {
    Duration::from_millis(keep_alive as u64 * 1500)
}

/// Result of scanning the input buffer for one whole packet.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A complete packet of `total` bytes is at the front of the buffer.
    Complete { total: usize },
    /// More bytes are needed.
    Partial,
}

/// SUBSCRIBE and UNSUBSCRIBE require fixed-header flags 0b0010
/// (MQTT-3.8.1-1, MQTT-3.10.1-1).
fn check_reserved_flags(command: Command, flags: u8) -> Result<()> {
    if flags != 0x02 {
        return Err(ProtocolError::MalformedPacket(format!(
            "{:?} fixed header flags must be 0x02, got {:#04x}",
            command, flags
        ))
        .into());
    }
    Ok(())
}

/// Scan the front of the buffer for a complete packet: fixed-header byte,
/// remaining-length field, `remaining` content bytes.
fn frame_packet(buf: &[u8], max_packet_size: usize) -> Result<Frame> {
    if buf.is_empty() {
        return Ok(Frame::Partial);
    }

    // Catch a bad command nibble before waiting on more bytes
    Command::from_nibble(buf[0] >> 4)?;

    match decode_variable_int(&buf[1..])? {
        Some((remaining, width)) => {
            let total = 1 + width + remaining;
            if total > max_packet_size {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{} byte packet exceeds the {} byte limit",
                    total, max_packet_size
                ))
                .into());
            }
            if buf.len() < total {
                Ok(Frame::Partial)
            } else {
                Ok(Frame::Complete { total })
            }
        }
        None => Ok(Frame::Partial),
    }
}

/// A packet decoded off the wire, owned so the input buffer can be
/// compacted before dispatch.
enum Inbound {
    Connect(ConnectPacket),
    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),
    Publish(PublishPacket),
    Pingreq,
    Disconnect,
    /// Commands with no handling yet (QoS 1/2 acknowledgments).
    Ignored(Command),
}

/// Per-connection driver.
pub struct Connection {
    stream: TcpStream,
    shared: SharedStateHandle,
    config: Arc<Config>,
    client: Client,
    handle: Arc<ClientHandle>,
    writer: Writer,
    read_buf: Vec<u8>,
    filled: usize,
}

impl Connection {
    /// Register the connection in the client table and set up its buffers.
    pub fn new(
        id: u64,
        stream: TcpStream,
        addr: SocketAddr,
        shared: SharedStateHandle,
        config: Arc<Config>,
    ) -> io::Result<Self> {
        let write_half = stream.try_clone()?;
        let handle = Arc::new(ClientHandle::new(id, write_half, addr));
        shared.clients.write().insert(id, Arc::clone(&handle));

        Ok(Self {
            stream,
            shared,
            config,
            client: Client::new(id, addr),
            handle,
            writer: Writer::new(),
            read_buf: vec![0u8; INITIAL_BUFFER_SIZE],
            filled: 0,
        })
    }

    /// Drive the connection until it ends, then release its resources.
    pub fn run(&mut self) {
        info!("[{}] connection from {}", self.client.id, self.client.addr);
        match self.run_loop() {
            Ok(()) => {}
            Err(Error::Io(e)) => warn!("[{}] I/O error: {}", self.client.id, e),
            Err(Error::Protocol(e)) => {
                warn!("[{}] protocol error, closing: {}", self.client.id, e)
            }
        }
        self.teardown();
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            if self.filled == self.read_buf.len() {
                self.grow_buffer()?;
            }

            let n = match self.stream.read(&mut self.read_buf[self.filled..]) {
                Ok(0) => {
                    debug!("[{}] peer closed the connection", self.client.id);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    info!(
                        "[{}] keep alive of {}s exceeded, dropping client",
                        self.client.id, self.client.keep_alive
                    );
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            self.filled += n;
            self.client.last_activity = Instant::now();

            if !self.drain_packets()? {
                return Ok(());
            }
        }
    }

    /// Double the input buffer, bounded by the configured packet limit.
    fn grow_buffer(&mut self) -> Result<()> {
        let cap = self.config.limits.max_packet_size as usize;
        if self.read_buf.len() >= cap {
            return Err(ProtocolError::MalformedPacket(format!(
                "input exceeds the {} byte packet limit",
                cap
            ))
            .into());
        }
        let new_size = (self.read_buf.len() * 2).min(cap);
        self.read_buf.resize(new_size, 0);
        Ok(())
    }

    /// Consume every complete packet in the buffer. Returns false when the
    /// connection should end.
    fn drain_packets(&mut self) -> Result<bool> {
        loop {
            let max = self.config.limits.max_packet_size as usize;
            let total = match frame_packet(&self.read_buf[..self.filled], max)? {
                Frame::Partial => return Ok(true),
                Frame::Complete { total } => total,
            };

            let inbound = self.decode_packet(total)?;

            // Compact the consumed frame out of the buffer
            self.read_buf.copy_within(total..self.filled, 0);
            self.filled -= total;

            if !self.dispatch(inbound)? {
                return Ok(false);
            }
        }
    }

    /// Decode one framed packet into an owned value.
    fn decode_packet(&mut self, total: usize) -> Result<Inbound> {
        let mut reader = Reader::new(&self.read_buf[..self.filled]);
        reader.start(total)?;
        let (command, flags) = reader.read_command()?;

        if command == Command::Disconnect {
            return Ok(Inbound::Disconnect);
        }

        reader.read_remaining_length()?;

        if self.client.state == ClientState::Connecting && command != Command::Connect {
            return Err(ProtocolError::FirstPacketNotConnect.into());
        }

        let version = self.client.protocol_version;
        match command {
            Command::Connect => {
                if self.client.state == ClientState::Connected {
                    return Err(ProtocolError::MalformedPacket(
                        "second CONNECT on an established connection".into(),
                    )
                    .into());
                }
                Ok(Inbound::Connect(connect::read_connect(&mut reader)?))
            }
            Command::Subscribe => {
                check_reserved_flags(command, flags)?;
                Ok(Inbound::Subscribe(packet::decode_subscribe(
                    &mut reader,
                    version,
                )?))
            }
            Command::Unsubscribe => {
                check_reserved_flags(command, flags)?;
                Ok(Inbound::Unsubscribe(packet::decode_unsubscribe(
                    &mut reader,
                    version,
                )?))
            }
            Command::Publish => Ok(Inbound::Publish(packet::decode_publish(
                &mut reader,
                flags,
                version,
            )?)),
            Command::Pingreq => Ok(Inbound::Pingreq),
            other => Ok(Inbound::Ignored(other)),
        }
    }

    /// Returns false when the connection should end.
    fn dispatch(&mut self, inbound: Inbound) -> Result<bool> {
        match inbound {
            Inbound::Connect(connect) => self.on_connect(connect),
            Inbound::Subscribe(subscribe) => {
                self.on_subscribe(subscribe)?;
                Ok(true)
            }
            Inbound::Unsubscribe(unsubscribe) => {
                self.on_unsubscribe(unsubscribe)?;
                Ok(true)
            }
            Inbound::Publish(publish) => {
                self.on_publish(publish)?;
                Ok(true)
            }
            Inbound::Pingreq => {
                self.on_pingreq()?;
                Ok(true)
            }
            Inbound::Disconnect => {
                debug!("[{}] DISCONNECT", self.client.id);
                self.client.graceful_disconnect = true;
                Ok(false)
            }
            Inbound::Ignored(command) => {
                debug!(
                    "[{}] {:?} not implemented, ignoring",
                    self.client.id, command
                );
                Ok(true)
            }
        }
    }

    /// Validate the handshake and answer with a CONNACK. A rejection closes
    /// the connection after the CONNACK is written.
    fn on_connect(&mut self, connect: ConnectPacket) -> Result<bool> {
        for violation in &connect.errors {
            warn!(
                "[{}] CONNECT violation {:?} at byte {}",
                self.client.id, violation.kind, violation.offset
            );
        }

        let code = connect::connack_reason(&connect.errors);
        let v5 = connect.protocol_version.is_v5();
        connect::write_connack(&mut self.writer, false, code, v5)?;
        self.flush()?;

        if code != reason_code::SUCCESS {
            info!(
                "[{}] CONNECT rejected with reason {:#04x}",
                self.client.id, code
            );
            return Ok(false);
        }

        self.client.state = ClientState::Connected;
        self.client.client_id = connect.client_id;
        self.client.protocol_version = connect.protocol_version;
        self.client.clean_start = connect.clean_start;
        self.client.keep_alive = connect.keep_alive;
        self.client.username = connect.username;
        self.client.password = connect.password;
        self.client.will = connect.will;

        if self.client.keep_alive > 0 {
            self.stream
                .set_read_timeout(Some(keep_alive_timeout(self.client.keep_alive)))?;
        }

        info!(
            "[{}] client {:?} connected ({:?}, keep alive {}s)",
            self.client.id, self.client.client_id, self.client.protocol_version,
            self.client.keep_alive
        );
        Ok(true)
    }

    /// Insert granted filters into the index and answer with a SUBACK whose
    /// codes mirror the request order, then deliver matching retained
    /// messages.
    fn on_subscribe(&mut self, subscribe: SubscribePacket) -> Result<()> {
        let mut codes = Vec::with_capacity(subscribe.requests.len());
        let mut granted = Vec::new();
        {
            let mut subscriptions = self.shared.subscriptions.write();
            for request in &subscribe.requests {
                match request.options {
                    Some(options) => {
                        subscriptions.subscribe(
                            &request.filter,
                            Subscriber {
                                id: self.client.id,
                                handle: Arc::clone(&self.handle),
                                qos: options.qos,
                                options,
                                subscription_id: subscribe.subscription_id,
                            },
                        );
                        self.client.subscriptions.push(request.filter.clone());
                        // Granted QoS is always 0 until the QoS 1/2 flow exists
                        codes.push(reason_code::GRANTED_QOS_0);
                        granted.push((request.filter.clone(), options));
                    }
                    None => codes.push(reason_code::UNSPECIFIED_ERROR),
                }
            }
        }

        debug!(
            "[{}] SUBSCRIBE #{}: {} granted of {}",
            self.client.id,
            subscribe.packet_id,
            granted.len(),
            codes.len()
        );

        self.writer.start_packet(Command::Suback, 0);
        self.writer.write_two_bytes(subscribe.packet_id);
        if self.client.protocol_version.is_v5() {
            self.writer.write_byte(0); // property length
        }
        for code in &codes {
            self.writer.write_byte(*code);
        }
        self.writer.finish_packet()?;
        self.flush()?;

        self.deliver_retained(&granted)
    }

    /// Send retained messages matching newly granted filters, with the
    /// retain flag set.
    fn deliver_retained(&mut self, granted: &[(String, SubscriptionOptions)]) -> Result<()> {
        for (filter, _options) in granted {
            let matched: Vec<(String, RetainedMessage)> = {
                let retained = self.shared.retained.read();
                retained
                    .iter()
                    .filter(|(topic, _)| topic_matches_filter(topic, filter))
                    .map(|(topic, message)| (topic.clone(), message.clone()))
                    .collect()
            };
            for (topic, message) in matched {
                debug!(
                    "[{}] retained {:?} delivered for filter {:?}",
                    self.client.id, topic, filter
                );
                let bytes = packet::encode_publish(topic.as_bytes(), &message.payload, true)?;
                self.handle.send(&bytes)?;
            }
        }
        Ok(())
    }

    /// Remove filters from the index and answer with an UNSUBACK. The
    /// v3.1.1 form has no payload; v5 carries one reason code per filter.
    fn on_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Result<()> {
        let mut codes = Vec::with_capacity(unsubscribe.filters.len());
        {
            let mut subscriptions = self.shared.subscriptions.write();
            for filter in &unsubscribe.filters {
                let existed = subscriptions.unsubscribe(filter, self.client.id);
                if existed {
                    if let Some(index) = self
                        .client
                        .subscriptions
                        .iter()
                        .position(|subscribed| subscribed == filter)
                    {
                        self.client.subscriptions.remove(index);
                    }
                }
                codes.push(if existed {
                    reason_code::SUCCESS
                } else {
                    reason_code::NO_SUBSCRIPTION_EXISTED
                });
            }
        }

        self.writer.start_packet(Command::Unsuback, 0);
        self.writer.write_two_bytes(unsubscribe.packet_id);
        if self.client.protocol_version.is_v5() {
            self.writer.write_byte(0); // property length
            for code in &codes {
                self.writer.write_byte(*code);
            }
        }
        self.writer.finish_packet()?;
        self.flush()
    }

    /// QoS 0 PUBLISH: update the retained store and fan out to matching
    /// subscribers. The QoS 1/2 inbound flow is not implemented.
    fn on_publish(&mut self, publish: PublishPacket) -> Result<()> {
        if publish.qos != QoS::AtMostOnce {
            debug!(
                "[{}] QoS {:?} PUBLISH not implemented, ignoring",
                self.client.id, publish.qos
            );
            return Ok(());
        }

        // The decoder validated the topic as UTF-8
        let topic = std::str::from_utf8(&publish.topic).unwrap_or("").to_string();

        if publish.retain {
            let mut retained = self.shared.retained.write();
            if publish.payload.is_empty() {
                retained.remove(&topic);
            } else {
                retained.insert(
                    topic.clone(),
                    RetainedMessage {
                        payload: publish.payload.clone(),
                        qos: publish.qos,
                    },
                );
            }
        }

        self.fan_out(&topic, &publish.payload)
    }

    /// Deliver a message to every matching subscriber, once per client, in
    /// the order the index visited them.
    fn fan_out(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let matched = self.shared.subscriptions.read().matches(topic);
        if matched.is_empty() {
            return Ok(());
        }

        let bytes = packet::encode_publish(topic.as_bytes(), payload, false)?;

        let mut seen = AHashSet::with_capacity(matched.len());
        for subscriber in matched {
            if subscriber.options.no_local && subscriber.id == self.client.id {
                continue;
            }
            if !seen.insert(subscriber.id) {
                continue;
            }
            // A dead or slow receiver is its own driver's problem
            if let Err(e) = subscriber.handle.send(&bytes) {
                debug!(
                    "[{}] delivery to client {} failed: {}",
                    self.client.id,
                    subscriber.id,
                    e
                );
            }
        }
        Ok(())
    }

    fn on_pingreq(&mut self) -> Result<()> {
        self.writer.start_packet(Command::Pingresp, 0);
        self.writer.finish_packet()?;
        self.flush()
    }

    /// Flush the writer through the client handle, so driver responses and
    /// cross-thread deliveries never interleave. A failed flush discards
    /// any half-written packet.
    fn flush(&mut self) -> Result<()> {
        if let Err(e) = self.handle.flush_writer(&mut self.writer) {
            self.writer.reset();
            return Err(e);
        }
        Ok(())
    }

    /// Release everything this connection holds: table entry first, then
    /// index references, then the will, then the stream.
    fn teardown(&mut self) {
        self.shared.clients.write().remove(&self.client.id);
        self.shared.subscriptions.write().remove_client(self.client.id);

        if !self.client.graceful_disconnect {
            if let Some(will) = self.client.will.take() {
                debug!(
                    "[{}] publishing will to {:?}",
                    self.client.id, will.topic
                );
                if will.retain {
                    let mut retained = self.shared.retained.write();
                    if will.payload.is_empty() {
                        retained.remove(&will.topic);
                    } else {
                        retained.insert(
                            will.topic.clone(),
                            RetainedMessage {
                                payload: will.payload.clone(),
                                qos: will.qos,
                            },
                        );
                    }
                }
                if let Err(e) = self.fan_out(&will.topic, &will.payload) {
                    debug!("[{}] will publish failed: {}", self.client.id, e);
                }
            }
        }

        info!("[{}] connection closed", self.client.id);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
