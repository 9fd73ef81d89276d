//! MQTT packet types for MQTT 3.1.1 and the 5.0 handshake surface.

use bytes::Bytes;

use crate::codec::{Reader, Writer};
use crate::error::{ProtocolError, Result};

/// MQTT Control Packet Types (4 bits).
///
/// The wire nibbles 0 and 15 are reserved; decoding rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

/// Wire nibble to command, for nibbles 1 through 14.
const COMMANDS: [Command; 14] = [
    Command::Connect,
    Command::Connack,
    Command::Publish,
    Command::Puback,
    Command::Pubrec,
    Command::Pubrel,
    Command::Pubcomp,
    Command::Subscribe,
    Command::Suback,
    Command::Unsubscribe,
    Command::Unsuback,
    Command::Pingreq,
    Command::Pingresp,
    Command::Disconnect,
];

impl Command {
    /// Decode the high nibble of a fixed-header byte.
    pub fn from_nibble(nibble: u8) -> std::result::Result<Self, ProtocolError> {
        match nibble {
            1..=14 => Ok(COMMANDS[(nibble - 1) as usize]),
            reserved => Err(ProtocolError::InvalidCommand(reserved)),
        }
    }
}

/// MQTT protocol versions as carried in the CONNECT protocol level byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ProtocolVersion {
    #[default]
    Invalid = 0,
    V3_1 = 3,
    V3_1_1 = 4,
    V5_0 = 5,
}

impl ProtocolVersion {
    /// Decode the protocol level byte. Unknown values map to `Invalid`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            3 => ProtocolVersion::V3_1,
            4 => ProtocolVersion::V3_1_1,
            5 => ProtocolVersion::V5_0,
            _ => ProtocolVersion::Invalid,
        }
    }

    /// Protocol name expected on the wire for this version.
    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V3_1 => "MQIsdp",
            _ => "MQTT",
        }
    }

    pub fn is_v5(self) -> bool {
        self == ProtocolVersion::V5_0
    }
}

/// Delivery guarantee for a message (0, 1, or 2 on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // named after the delivery guarantees
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Decode a two-bit QoS field. The wire value 3 is a protocol error.
    pub fn from_bits(bits: u8) -> std::result::Result<Self, ProtocolError> {
        [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce]
            .get(bits as usize)
            .copied()
            .ok_or_else(|| ProtocolError::MalformedPacket(format!("QoS {} is out of range", bits)))
    }
}

/// Reason codes used in CONNACK, SUBACK and UNSUBACK.
/// Constants rather than enum values since some codes share a numeric value
/// with different semantic meanings depending on context. Values below 0x80
/// are successes.
#[allow(dead_code)]
pub mod reason_code {
    pub const SUCCESS: u8 = 0x00;
    pub const GRANTED_QOS_0: u8 = 0x00;
    pub const GRANTED_QOS_1: u8 = 0x01;
    pub const GRANTED_QOS_2: u8 = 0x02;
    pub const DISCONNECT_WITH_WILL: u8 = 0x04;
    pub const NO_MATCHING_SUBSCRIBERS: u8 = 0x10;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const CONTINUE_AUTHENTICATION: u8 = 0x18;
    pub const RE_AUTHENTICATE: u8 = 0x19;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_IDENTIFIER_NOT_VALID: u8 = 0x85;
    pub const BAD_USER_NAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_BUSY: u8 = 0x89;
    pub const BANNED: u8 = 0x8A;
    pub const SERVER_SHUTTING_DOWN: u8 = 0x8B;
    pub const BAD_AUTHENTICATION_METHOD: u8 = 0x8C;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const PACKET_IDENTIFIER_IN_USE: u8 = 0x91;
    pub const PACKET_IDENTIFIER_NOT_FOUND: u8 = 0x92;
    pub const RECEIVE_MAXIMUM_EXCEEDED: u8 = 0x93;
    pub const TOPIC_ALIAS_INVALID: u8 = 0x94;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const MESSAGE_RATE_TOO_HIGH: u8 = 0x96;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
    pub const ADMINISTRATIVE_ACTION: u8 = 0x98;
    pub const PAYLOAD_FORMAT_INVALID: u8 = 0x99;
    pub const RETAIN_NOT_SUPPORTED: u8 = 0x9A;
    pub const QOS_NOT_SUPPORTED: u8 = 0x9B;
    pub const USE_ANOTHER_SERVER: u8 = 0x9C;
    pub const SERVER_MOVED: u8 = 0x9D;
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0x9E;
    pub const CONNECTION_RATE_EXCEEDED: u8 = 0x9F;
    pub const MAXIMUM_CONNECT_TIME: u8 = 0xA0;
    pub const SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED: u8 = 0xA1;
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0xA2;
}

/// Subscription options unpacked from the SUBSCRIBE options byte:
/// `[reserved:2 | retain_handling:2 | retain_as_published:1 | no_local:1 | qos:2]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    /// Parse from a SUBSCRIBE options byte. Fails on QoS 3.
    pub fn from_byte(byte: u8) -> std::result::Result<Self, ProtocolError> {
        Ok(Self {
            qos: QoS::from_bits(byte & 0x03)?,
            no_local: byte & (1 << 2) != 0,
            retain_as_published: byte & (1 << 3) != 0,
            retain_handling: (byte >> 4) & 0x03,
        })
    }
}

/// Will message configuration carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Raw MQTT 5 will property block (`None` for v3.1.1); kept unparsed.
    #[allow(dead_code)]
    pub properties: Option<Bytes>,
}

/// One SUBSCRIBE entry in request order.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub filter: String,
    /// `None` when the entry was rejected (empty filter or bad QoS bits);
    /// it keeps its position so SUBACK codes line up with the request.
    pub options: Option<SubscriptionOptions>,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct SubscribePacket {
    pub packet_id: u16,
    /// MQTT 5 subscription identifier. Property parsing is not implemented,
    /// so this stays `None`.
    pub subscription_id: Option<u32>,
    pub requests: Vec<SubscribeRequest>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// PUBLISH packet data.
#[derive(Debug, Clone)]
#[allow(dead_code)] // dup/packet_id/properties feed the QoS 1/2 flow
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Bytes,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    /// Raw MQTT 5 property block, forwarded as-is.
    pub properties: Option<Bytes>,
}

/// Decode a SUBSCRIBE payload from a reader positioned after the
/// remaining-length field.
///
/// Entries that fail per-filter validation (empty filter, QoS 3) keep their
/// position with `options: None`; reserved option bits make the whole
/// packet malformed. For v5 the property block after the packet id is
/// skipped without being parsed.
pub fn decode_subscribe(reader: &mut Reader, version: ProtocolVersion) -> Result<SubscribePacket> {
    let packet_id = reader.read_two_bytes()?;

    if version.is_v5() {
        reader.skip_variable_block()?;
    }

    // v3.1.1 reserves bits 2..=7 of the options byte; v5 assigns meaning to
    // bits 2..=5 and reserves the top two.
    let reserved_mask: u8 = if version.is_v5() { 0xC0 } else { 0xFC };

    let mut requests = Vec::new();
    while !reader.at_end() {
        let filter = reader.read_utf8_string(true)?;
        let filter_pos = reader.previous_pos();
        let options_byte = reader.read_byte()?;

        if options_byte & reserved_mask != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "reserved subscription option bits set: {:#04x}",
                options_byte
            ))
            .into());
        }

        match filter {
            None => {
                log::debug!("SUBSCRIBE entry at byte {} has an empty filter", filter_pos);
                requests.push(SubscribeRequest {
                    filter: String::new(),
                    options: None,
                });
            }
            Some(filter) => match SubscriptionOptions::from_byte(options_byte) {
                Ok(options) => requests.push(SubscribeRequest {
                    filter: filter.to_string(),
                    options: Some(options),
                }),
                Err(_) => {
                    log::debug!("SUBSCRIBE entry {:?} requests QoS 3", filter);
                    requests.push(SubscribeRequest {
                        filter: filter.to_string(),
                        options: None,
                    });
                }
            },
        }
    }

    if requests.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topic filters".into()).into());
    }

    Ok(SubscribePacket {
        packet_id,
        subscription_id: None,
        requests,
    })
}

/// Decode an UNSUBSCRIBE payload.
pub fn decode_unsubscribe(
    reader: &mut Reader,
    version: ProtocolVersion,
) -> Result<UnsubscribePacket> {
    let packet_id = reader.read_two_bytes()?;

    if version.is_v5() {
        reader.skip_variable_block()?;
    }

    let mut filters = Vec::new();
    while !reader.at_end() {
        match reader.read_utf8_string(false)? {
            Some(filter) => filters.push(filter.to_string()),
            None => {
                return Err(ProtocolError::MalformedPacket(
                    "UNSUBSCRIBE with an empty topic filter".into(),
                )
                .into())
            }
        }
    }

    if filters.is_empty() {
        return Err(
            ProtocolError::MalformedPacket("UNSUBSCRIBE with no topic filters".into()).into(),
        );
    }

    Ok(UnsubscribePacket { packet_id, filters })
}

/// Decode a PUBLISH packet from its fixed-header flag nibble and payload.
///
/// Topic names must be non-empty and must not carry filter wildcards.
pub fn decode_publish(
    reader: &mut Reader,
    flags: u8,
    version: ProtocolVersion,
) -> Result<PublishPacket> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::from_bits((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let topic = match reader.read_utf8_string(false)? {
        Some(topic) => topic,
        None => {
            return Err(ProtocolError::MalformedPacket("PUBLISH without a topic".into()).into())
        }
    };
    if topic.contains('+') || topic.contains('#') {
        return Err(ProtocolError::MalformedPacket(format!(
            "wildcards are not allowed in a published topic: {:?}",
            topic
        ))
        .into());
    }

    let packet_id = if qos != QoS::AtMostOnce {
        Some(reader.read_two_bytes()?)
    } else {
        None
    };

    let properties = if version.is_v5() {
        Some(Bytes::copy_from_slice(reader.skip_variable_block()?))
    } else {
        None
    };

    let payload = reader.read_bytes(reader.remaining())?;

    Ok(PublishPacket {
        dup,
        qos,
        retain,
        topic: Bytes::copy_from_slice(topic.as_bytes()),
        packet_id,
        payload: Bytes::copy_from_slice(payload),
        properties,
    })
}

/// Serialize a QoS 0 PUBLISH once, for fan-out to every matched subscriber.
pub fn encode_publish(topic: &[u8], payload: &[u8], retain: bool) -> Result<Bytes> {
    let mut writer = Writer::new();
    writer.start_packet(Command::Publish, retain as u8);
    writer.write_binary(topic);
    writer.write_raw(payload);
    writer.finish_packet()?;
    Ok(Bytes::copy_from_slice(writer.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn reader_for<'a>(buf: &'a [u8]) -> Reader<'a> {
        let mut reader = Reader::new(buf);
        reader.start(buf.len()).unwrap();
        reader
    }

    /// Position a reader after the fixed header of a full packet.
    fn payload_reader<'a>(packet: &'a [u8]) -> Reader<'a> {
        let mut reader = reader_for(packet);
        reader.read_command().unwrap();
        reader.read_remaining_length().unwrap();
        reader
    }

    #[test]
    fn test_command_from_nibble() {
        assert_eq!(Command::from_nibble(1).unwrap(), Command::Connect);
        assert_eq!(Command::from_nibble(8).unwrap(), Command::Subscribe);
        assert_eq!(Command::from_nibble(14).unwrap(), Command::Disconnect);
        assert_eq!(
            Command::from_nibble(0),
            Err(ProtocolError::InvalidCommand(0))
        );
        assert_eq!(
            Command::from_nibble(15),
            Err(ProtocolError::InvalidCommand(15))
        );
    }

    #[test]
    fn test_protocol_version() {
        assert_eq!(ProtocolVersion::from_u8(0), ProtocolVersion::Invalid);
        assert_eq!(ProtocolVersion::from_u8(3), ProtocolVersion::V3_1);
        assert_eq!(ProtocolVersion::from_u8(4), ProtocolVersion::V3_1_1);
        assert_eq!(ProtocolVersion::from_u8(5), ProtocolVersion::V5_0);
        assert_eq!(ProtocolVersion::from_u8(6), ProtocolVersion::Invalid);
        assert_eq!(ProtocolVersion::V3_1.protocol_name(), "MQIsdp");
        assert_eq!(ProtocolVersion::V3_1_1.protocol_name(), "MQTT");
        assert_eq!(ProtocolVersion::V5_0.protocol_name(), "MQTT");
        assert!(ProtocolVersion::V5_0.is_v5());
        assert!(!ProtocolVersion::V3_1_1.is_v5());
    }

    #[test]
    fn test_qos_from_bits() {
        assert_eq!(QoS::from_bits(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::from_bits(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::from_bits(3).is_err());
    }

    #[test]
    fn test_subscription_options_from_byte() {
        let options = SubscriptionOptions::from_byte(0x00).unwrap();
        assert_eq!(options.qos, QoS::AtMostOnce);
        assert!(!options.no_local);

        let options = SubscriptionOptions::from_byte(0x2E).unwrap();
        assert_eq!(options.qos, QoS::ExactlyOnce);
        assert!(options.no_local);
        assert!(options.retain_as_published);
        assert_eq!(options.retain_handling, 2);

        assert!(SubscriptionOptions::from_byte(0x03).is_err());
    }

    #[test]
    fn test_decode_subscribe() {
        // packet_id=1, "a/b" at QoS 0
        let packet = [
            0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x00,
        ];
        let mut reader = payload_reader(&packet);
        let subscribe = decode_subscribe(&mut reader, ProtocolVersion::V3_1_1).unwrap();
        assert_eq!(subscribe.packet_id, 1);
        assert_eq!(subscribe.requests.len(), 1);
        assert_eq!(subscribe.requests[0].filter, "a/b");
        assert_eq!(
            subscribe.requests[0].options.unwrap().qos,
            QoS::AtMostOnce
        );
        assert!(subscribe.subscription_id.is_none());
    }

    #[test]
    fn test_decode_subscribe_multiple_filters() {
        let packet = [
            0x82, 0x0E, 0x00, 0x07, // packet id
            0x00, 0x03, b'a', b'/', b'b', 0x01, // "a/b" QoS 1
            0x00, 0x03, b'c', b'/', b'd', 0x02, // "c/d" QoS 2
        ];
        let mut reader = payload_reader(&packet);
        let subscribe = decode_subscribe(&mut reader, ProtocolVersion::V3_1_1).unwrap();
        assert_eq!(subscribe.packet_id, 7);
        assert_eq!(subscribe.requests.len(), 2);
        assert_eq!(
            subscribe.requests[0].options.unwrap().qos,
            QoS::AtLeastOnce
        );
        assert_eq!(
            subscribe.requests[1].options.unwrap().qos,
            QoS::ExactlyOnce
        );
    }

    #[test]
    fn test_decode_subscribe_rejects_reserved_bits() {
        let packet = [
            0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x04,
        ];
        let mut reader = payload_reader(&packet);
        assert!(matches!(
            decode_subscribe(&mut reader, ProtocolVersion::V3_1_1),
            Err(Error::Protocol(ProtocolError::MalformedPacket(_)))
        ));
    }

    #[test]
    fn test_decode_subscribe_v5_allows_option_bits() {
        // no_local + retain_as_published are valid option bits under v5;
        // a v5 SUBSCRIBE carries a property block after the packet id.
        let packet = [
            0x82, 0x09, 0x00, 0x01, 0x00, 0x00, 0x03, b'a', b'/', b'b', 0x0C,
        ];
        let mut reader = payload_reader(&packet);
        let subscribe = decode_subscribe(&mut reader, ProtocolVersion::V5_0).unwrap();
        let options = subscribe.requests[0].options.unwrap();
        assert!(options.no_local);
        assert!(options.retain_as_published);
    }

    #[test]
    fn test_decode_subscribe_empty_filter_fails_entry() {
        let packet = [0x82, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00];
        let mut reader = payload_reader(&packet);
        let subscribe = decode_subscribe(&mut reader, ProtocolVersion::V3_1_1).unwrap();
        assert_eq!(subscribe.requests.len(), 1);
        assert!(subscribe.requests[0].options.is_none());
    }

    #[test]
    fn test_decode_subscribe_qos3_fails_entry() {
        let packet = [
            0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x03,
        ];
        let mut reader = payload_reader(&packet);
        let subscribe = decode_subscribe(&mut reader, ProtocolVersion::V3_1_1).unwrap();
        assert_eq!(subscribe.requests[0].filter, "a/b");
        assert!(subscribe.requests[0].options.is_none());
    }

    #[test]
    fn test_decode_subscribe_no_filters() {
        let packet = [0x82, 0x02, 0x00, 0x01];
        let mut reader = payload_reader(&packet);
        assert!(matches!(
            decode_subscribe(&mut reader, ProtocolVersion::V3_1_1),
            Err(Error::Protocol(ProtocolError::MalformedPacket(_)))
        ));
    }

    #[test]
    fn test_decode_unsubscribe() {
        let packet = [
            0xA2, 0x07, 0x00, 0x09, 0x00, 0x03, b'a', b'/', b'b',
        ];
        let mut reader = payload_reader(&packet);
        let unsubscribe = decode_unsubscribe(&mut reader, ProtocolVersion::V3_1_1).unwrap();
        assert_eq!(unsubscribe.packet_id, 9);
        assert_eq!(unsubscribe.filters, vec!["a/b".to_string()]);
    }

    #[test]
    fn test_decode_unsubscribe_empty_filter() {
        let packet = [0xA2, 0x04, 0x00, 0x09, 0x00, 0x00];
        let mut reader = payload_reader(&packet);
        assert!(decode_unsubscribe(&mut reader, ProtocolVersion::V3_1_1).is_err());
    }

    #[test]
    fn test_decode_publish_qos0() {
        let packet = [
            0x30, 0x0A, 0x00, 0x03, b'a', b'/', b'b', b'h', b'e', b'l', b'l', b'o',
        ];
        let mut reader = payload_reader(&packet);
        let publish = decode_publish(&mut reader, 0x00, ProtocolVersion::V3_1_1).unwrap();
        assert_eq!(publish.qos, QoS::AtMostOnce);
        assert!(!publish.dup);
        assert!(!publish.retain);
        assert_eq!(&publish.topic[..], b"a/b");
        assert_eq!(publish.packet_id, None);
        assert_eq!(&publish.payload[..], b"hello");
    }

    #[test]
    fn test_decode_publish_qos1_with_packet_id() {
        let packet = [
            0x33, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x2A, b'h', b'i',
        ];
        let mut reader = payload_reader(&packet);
        let publish = decode_publish(&mut reader, 0x03, ProtocolVersion::V3_1_1).unwrap();
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert!(publish.retain);
        assert_eq!(publish.packet_id, Some(42));
        assert_eq!(&publish.payload[..], b"hi");
    }

    #[test]
    fn test_decode_publish_rejects_wildcard_topic() {
        let packet = [
            0x30, 0x05, 0x00, 0x03, b'a', b'/', b'+',
        ];
        let mut reader = payload_reader(&packet);
        assert!(matches!(
            decode_publish(&mut reader, 0x00, ProtocolVersion::V3_1_1),
            Err(Error::Protocol(ProtocolError::MalformedPacket(_)))
        ));
    }

    #[test]
    fn test_decode_publish_rejects_empty_topic() {
        let packet = [0x30, 0x04, 0x00, 0x00, b'h', b'i'];
        let mut reader = payload_reader(&packet);
        assert!(decode_publish(&mut reader, 0x00, ProtocolVersion::V3_1_1).is_err());
    }

    #[test]
    fn test_encode_publish() {
        let bytes = encode_publish(b"a/b", b"hello", false).unwrap();
        assert_eq!(
            &bytes[..],
            &[0x30, 0x0A, 0x00, 0x03, b'a', b'/', b'b', b'h', b'e', b'l', b'l', b'o']
        );

        let retained = encode_publish(b"a/b", b"x", true).unwrap();
        assert_eq!(retained[0], 0x31);
    }
}
