//! CONNECT handshake validation and CONNACK emission.
//!
//! The validator reads the whole variable header and payload without
//! short-circuiting: every violation is recorded together with the byte
//! offset at which it was detected, so a malformed handshake surfaces all
//! of its problems in the log while the first violation alone decides the
//! CONNACK reason code. Only codec-level failures (truncation, bad UTF-8 in
//! fields without a dedicated violation) abort the pass.

use bytes::Bytes;

use crate::codec::{Reader, Writer};
use crate::error::Result;
use crate::packet::{reason_code, Command, ProtocolVersion, QoS, Will};

/// Broker policy bounds for client identifiers, looser than the protocol's
/// 1..=23 floor.
pub const CLIENT_ID_MIN_LEN: usize = 2;
pub const CLIENT_ID_MAX_LEN: usize = 64;

/// Everything the handshake validator can object to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    ProtocolNameNotMqtt,
    ProtocolVersionInvalid,
    UnsupportedVersion,
    /// Reserved bit 0 of the connect flags is set.
    MalformedPacket,
    EmptyClientIdWithoutCleanSession,
    ClientIdTooShort,
    ClientIdTooLong,
    InvalidClientId,
    ClientIdNotUtf8,
    InvalidWillQos,
    WillTopicMustBePresent,
    WillMessageMustBePresent,
    WillQosMustBeZero,
    PasswordMustNotBeSet,
    UsernameMustBePresent,
    PasswordMustBePresent,
    UnexpectedExtraData,
}

/// A single violation and the byte offset where it was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub offset: usize,
}

/// Decoded CONNECT packet plus accumulated violations.
#[derive(Debug, Clone)]
#[allow(dead_code)] // raw wire fields kept for diagnostics
pub struct ConnectPacket {
    pub protocol_name: String,
    /// Raw protocol level byte as received.
    pub protocol_level: u8,
    pub protocol_version: ProtocolVersion,
    /// Raw connect flags byte as received.
    pub connect_flags: u8,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    /// Raw MQTT 5 CONNECT property block, kept unparsed.
    pub properties: Option<Bytes>,
    /// Violations in detection order. Empty means the handshake is valid.
    pub errors: Vec<Violation>,
}

impl ConnectPacket {
    #[allow(dead_code)]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Client id characters accepted by broker policy and by the protocol rule.
fn is_client_id_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
}

/// The protocol-level client id rule (MQTT-3.1.3-5): 1..=23 characters
/// from `[0-9A-Za-z]`. The validator applies the broker policy bounds of
/// [`CLIENT_ID_MIN_LEN`]..=[`CLIENT_ID_MAX_LEN`] instead.
#[allow(dead_code)]
pub fn is_valid_client_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 23 && id.bytes().all(is_client_id_byte)
}

/// Read the CONNECT variable header and payload from a reader positioned
/// after the remaining-length field.
pub fn read_connect(reader: &mut Reader) -> Result<ConnectPacket> {
    fn push(errors: &mut Vec<Violation>, kind: ViolationKind, offset: usize) {
        errors.push(Violation { kind, offset });
    }

    let mut errors: Vec<Violation> = Vec::new();

    // 1. Protocol name
    let protocol_name = reader
        .read_utf8_string(true)?
        .unwrap_or_default()
        .to_string();
    if protocol_name != "MQTT" {
        push(
            &mut errors,
            ViolationKind::ProtocolNameNotMqtt,
            reader.previous_pos(),
        );
    }

    // 2. Protocol version
    let protocol_level = reader.read_byte()?;
    let level_pos = reader.previous_pos();
    let protocol_version = ProtocolVersion::from_u8(protocol_level);
    match protocol_version {
        ProtocolVersion::Invalid => {
            push(&mut errors, ViolationKind::ProtocolVersionInvalid, level_pos)
        }
        ProtocolVersion::V3_1 => push(&mut errors, ViolationKind::UnsupportedVersion, level_pos),
        ProtocolVersion::V3_1_1 | ProtocolVersion::V5_0 => {}
    }

    // 3. Connect flags:
    // [username:1 | password:1 | will_retain:1 | will_qos:2 | will:1 | clean:1 | reserved:1]
    let connect_flags = reader.read_byte()?;
    let flags_pos = reader.previous_pos();
    let username_flag = connect_flags & 0x80 != 0;
    let password_flag = connect_flags & 0x40 != 0;
    let will_retain = connect_flags & 0x20 != 0;
    let will_qos_bits = (connect_flags >> 3) & 0x03;
    let will_flag = connect_flags & 0x04 != 0;
    let clean_start = connect_flags & 0x02 != 0;
    if connect_flags & 0x01 != 0 {
        push(&mut errors, ViolationKind::MalformedPacket, flags_pos);
    }

    // 4. Keep alive (seconds; 0 disables)
    let keep_alive = reader.read_two_bytes()?;

    // v5 carries a property block here; skipped, kept raw
    let properties = if protocol_version.is_v5() {
        Some(Bytes::copy_from_slice(reader.skip_variable_block()?))
    } else {
        None
    };

    // 5. Client identifier
    let client_id_bytes = reader.read_binary()?;
    let client_id_pos = reader.previous_pos();
    let mut client_id = String::new();
    match client_id_bytes {
        None => {
            if !clean_start {
                push(
                    &mut errors,
                    ViolationKind::EmptyClientIdWithoutCleanSession,
                    client_id_pos,
                );
            } else {
                // An empty id with clean_start would need a broker-assigned
                // id, which is not implemented; the policy floor rejects it.
                push(&mut errors, ViolationKind::ClientIdTooShort, client_id_pos);
            }
        }
        Some(bytes) => match std::str::from_utf8(bytes) {
            Err(_) => push(&mut errors, ViolationKind::ClientIdNotUtf8, client_id_pos),
            Ok(id) => {
                if id.len() < CLIENT_ID_MIN_LEN {
                    push(&mut errors, ViolationKind::ClientIdTooShort, client_id_pos);
                } else if id.len() > CLIENT_ID_MAX_LEN {
                    push(&mut errors, ViolationKind::ClientIdTooLong, client_id_pos);
                } else if !id.bytes().all(is_client_id_byte) {
                    push(&mut errors, ViolationKind::InvalidClientId, client_id_pos);
                }
                client_id = id.to_string();
            }
        },
    }

    // 6. Will
    let mut will = None;
    if will_flag {
        if will_qos_bits > 2 {
            push(&mut errors, ViolationKind::InvalidWillQos, flags_pos);
        }
        let will_properties = if protocol_version.is_v5() {
            Some(Bytes::copy_from_slice(reader.skip_variable_block()?))
        } else {
            None
        };
        let will_topic = reader.read_utf8_string(false)?;
        if will_topic.is_none() {
            push(
                &mut errors,
                ViolationKind::WillTopicMustBePresent,
                reader.previous_pos(),
            );
        }
        let will_payload = reader.read_binary()?;
        if will_payload.is_none() {
            push(
                &mut errors,
                ViolationKind::WillMessageMustBePresent,
                reader.previous_pos(),
            );
        }
        if let (Some(topic), Some(payload), Ok(qos)) =
            (will_topic, will_payload, QoS::from_bits(will_qos_bits))
        {
            will = Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos,
                retain: will_retain,
                properties: will_properties,
            });
        }
    } else if will_qos_bits != 0 {
        push(&mut errors, ViolationKind::WillQosMustBeZero, flags_pos);
    }

    // 7. A password without a username is invalid under v3.1.1 semantics
    if password_flag && !username_flag {
        push(&mut errors, ViolationKind::PasswordMustNotBeSet, flags_pos);
    }

    // 8. Username
    let mut username = None;
    if username_flag {
        match reader.read_utf8_string(false)? {
            Some(name) => username = Some(name.to_string()),
            None => push(
                &mut errors,
                ViolationKind::UsernameMustBePresent,
                reader.previous_pos(),
            ),
        }
    }

    // 9. Password
    let mut password = None;
    if password_flag {
        match reader.read_binary()? {
            Some(bytes) => password = Some(bytes.to_vec()),
            None => push(
                &mut errors,
                ViolationKind::PasswordMustBePresent,
                reader.previous_pos(),
            ),
        }
    }

    // 10. Nothing may follow the last required field
    if !reader.at_end() {
        push(&mut errors, ViolationKind::UnexpectedExtraData, reader.pos());
    }

    Ok(ConnectPacket {
        protocol_name,
        protocol_level,
        protocol_version,
        connect_flags,
        clean_start,
        keep_alive,
        client_id,
        will,
        username,
        password,
        properties,
        errors,
    })
}

/// Map the first violation to the CONNACK reason code. Later entries are
/// diagnostics only.
pub fn connack_reason(errors: &[Violation]) -> u8 {
    use ViolationKind::*;
    match errors.first().map(|violation| violation.kind) {
        None => reason_code::SUCCESS,
        Some(UsernameMustBePresent | PasswordMustBePresent | PasswordMustNotBeSet) => {
            reason_code::BAD_USER_NAME_OR_PASSWORD
        }
        Some(
            ClientIdNotUtf8 | ClientIdTooShort | ClientIdTooLong | InvalidClientId
            | EmptyClientIdWithoutCleanSession,
        ) => reason_code::CLIENT_IDENTIFIER_NOT_VALID,
        Some(ProtocolVersionInvalid | UnsupportedVersion) => {
            reason_code::UNSUPPORTED_PROTOCOL_VERSION
        }
        Some(_) => reason_code::MALFORMED_PACKET,
    }
}

/// Serialize a CONNACK. The v5 form appends an empty property block after
/// the reason code.
pub fn write_connack(writer: &mut Writer, session_present: bool, code: u8, v5: bool) -> Result<()> {
    writer.start_packet(Command::Connack, 0);
    writer.write_byte(session_present as u8);
    writer.write_byte(code);
    if v5 {
        writer.write_byte(0); // property length
    }
    writer.finish_packet()
}
