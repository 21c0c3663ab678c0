//! Connection-phase payloads: server greeting, handshake response,
//! SSL request, auth switch and COM_CHANGE_USER.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::sync::OnceLock;

use mywire_core::{Error, InterfaceErrorKind, Result};
use regex::Regex;

use crate::protocol::{Command, PacketReader, PacketWriter, capabilities, malformed};

/// Everything the server tells us in its initial greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub protocol_version: u8,
    pub server_version: String,
    /// Parsed (major, minor, patch)
    pub version: (u16, u16, u16),
    pub connection_id: u32,
    /// Scramble: both parts concatenated, trailing NUL removed
    pub auth_data: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

impl HandshakeInfo {
    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    /// Is the server at least `major.minor.patch`?
    pub fn version_at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        self.version >= (major, minor, patch)
    }
}

fn version_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{1,3})(.*)").ok())
        .as_ref()
}

/// Parse and gate a server version string.
///
/// Strings that do not start with `major.minor.patch` are rejected, as are
/// servers older than 4.1 (1.4 for Fabric).
pub fn parse_server_version(version: &str) -> Result<(u16, u16, u16)> {
    let unsupported = |msg: String| Error::interface(InterfaceErrorKind::UnsupportedServer, msg);
    let caps = version_regex()
        .and_then(|re| re.captures(version))
        .ok_or_else(|| unsupported(format!("Failed parsing MySQL version '{}'", version)))?;

    let part = |i: usize| -> Result<u16> {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| unsupported(format!("Failed parsing MySQL version '{}'", version)))
    };
    let parsed = (part(1)?, part(2)?, part(3)?);
    let tail = caps.get(4).map_or("", |m| m.as_str());

    let minimum = if tail.contains("fabric") { (1, 4, 0) } else { (4, 1, 0) };
    if parsed < minimum {
        return Err(unsupported(format!(
            "MySQL Version '{}' is not supported",
            version
        )));
    }
    Ok(parsed)
}

/// Parse the initial handshake (protocol version 10).
pub fn parse_handshake(payload: &[u8]) -> Result<HandshakeInfo> {
    if payload.first() == Some(&0xFF) {
        return Err(crate::protocol::error_from_packet(payload));
    }

    let mut reader = PacketReader::new(payload);
    let protocol_version = reader.read_u8().ok_or_else(|| malformed("handshake"))?;
    if protocol_version != 10 {
        return Err(Error::interface(
            InterfaceErrorKind::UnsupportedServer,
            format!("Unsupported protocol version: {}", protocol_version),
        ));
    }

    let server_version = reader.read_null_string();
    let version = parse_server_version(&server_version)?;

    let connection_id = reader.read_u32_le().ok_or_else(|| malformed("handshake"))?;
    let auth_part1 = reader.read_bytes(8).ok_or_else(|| malformed("handshake"))?;
    reader.skip(1);

    let caps_lower = reader.read_u16_le().unwrap_or(0);
    let charset = reader.read_u8().unwrap_or(0);
    let status_flags = reader.read_u16_le().unwrap_or(0);
    let caps_upper = reader.read_u16_le().unwrap_or(0);
    let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

    let auth_data_len = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_u8().unwrap_or(0)
    } else {
        reader.skip(1);
        0
    };
    reader.skip(10);

    let mut auth_data = auth_part1.to_vec();
    if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len2 = std::cmp::max(13, usize::from(auth_data_len).saturating_sub(8));
        if let Some(part2) = reader.read_bytes(len2.min(reader.remaining())) {
            auth_data.extend_from_slice(part2);
        }
        if auth_data.last() == Some(&0) {
            auth_data.pop();
        }
    }

    let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string()
    } else {
        String::new()
    };

    Ok(HandshakeInfo {
        protocol_version,
        server_version,
        version,
        connection_id,
        auth_data,
        capabilities,
        charset,
        status_flags,
        auth_plugin,
    })
}

/// Fields of the client's handshake response.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a HashMap<String, String>,
}

/// Build the HandshakeResponse41 payload.
pub fn build_handshake_response(resp: &HandshakeResponse<'_>) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u32_le(resp.capabilities);
    writer.write_u32_le(resp.max_packet_size);
    writer.write_u8(resp.charset);
    writer.write_zeros(23);
    writer.write_null_string(resp.user);
    write_auth_response(&mut writer, resp.capabilities, resp.auth_response);

    if resp.capabilities & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        writer.write_null_string(resp.database.unwrap_or(""));
    }
    if resp.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(resp.auth_plugin);
    }
    if resp.capabilities & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        write_attributes(&mut writer, resp.attributes);
    }
    writer.into_bytes()
}

fn write_auth_response(writer: &mut PacketWriter, caps: u32, auth: &[u8]) {
    if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(auth);
    } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        writer.write_u8(auth.len() as u8);
        writer.write_bytes(auth);
    } else {
        writer.write_bytes(auth);
        writer.write_u8(0);
    }
}

fn write_attributes(writer: &mut PacketWriter, attributes: &HashMap<String, String>) {
    let mut attrs = PacketWriter::new();
    let mut keys: Vec<_> = attributes.keys().collect();
    keys.sort();
    for key in keys {
        attrs.write_lenenc_string(key);
        attrs.write_lenenc_string(&attributes[key]);
    }
    writer.write_lenenc_bytes(attrs.as_bytes());
}

/// Build the 32-byte SSLRequest payload sent before the TLS handshake.
pub fn build_ssl_request(client_caps: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(charset);
    writer.write_zeros(23);
    writer.into_bytes()
}

/// Build a COM_CHANGE_USER payload.
pub fn build_change_user(
    caps: u32,
    user: &str,
    auth_response: &[u8],
    database: Option<&str>,
    charset: u8,
    auth_plugin: &str,
    attributes: &HashMap<String, String>,
) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::ChangeUser);
    writer.write_null_string(user);
    if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        writer.write_u8(auth_response.len() as u8);
        writer.write_bytes(auth_response);
    } else {
        writer.write_bytes(auth_response);
        writer.write_u8(0);
    }
    writer.write_null_string(database.unwrap_or(""));
    writer.write_u16_le(u16::from(charset));
    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(auth_plugin);
    }
    if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        write_attributes(&mut writer, attributes);
    }
    writer.into_bytes()
}

/// A packet received while authenticating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPacket {
    Ok(crate::protocol::OkPacket),
    /// Server asks us to retry with another plugin
    Switch { plugin: String, data: Vec<u8> },
    /// Pre-4.1 password scheme request
    OldPassword,
    /// Plugin-specific continuation data (0x01 prefix stripped)
    MoreData(Vec<u8>),
}

/// Classify a packet received during authentication.
///
/// Server errors surface as `Err`.
pub fn parse_auth_packet(payload: &[u8]) -> Result<AuthPacket> {
    match payload.first() {
        None => Err(Error::interface(
            InterfaceErrorKind::EmptyResponse,
            "Empty authentication response",
        )),
        Some(0xFF) => Err(crate::protocol::error_from_packet(payload)),
        Some(0x00) => PacketReader::new(payload)
            .parse_ok_packet()
            .map(AuthPacket::Ok)
            .ok_or_else(|| malformed("OK")),
        Some(0xFE) if payload.len() == 1 => Ok(AuthPacket::OldPassword),
        Some(0xFE) => {
            let mut reader = PacketReader::new(&payload[1..]);
            let plugin = reader.read_null_string();
            let mut data = reader.read_rest().to_vec();
            if data.last() == Some(&0) {
                data.pop();
            }
            Ok(AuthPacket::Switch { plugin, data })
        }
        Some(0x01) => Ok(AuthPacket::MoreData(payload[1..].to_vec())),
        Some(b) => Err(Error::interface(
            InterfaceErrorKind::Protocol,
            format!("Unexpected authentication packet: {:#04X}", b),
        )),
    }
}
