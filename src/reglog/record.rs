//! Register Log Record Codec
//!
//! Pure encode/decode of the register log format, independent of file I/O.
//!
//! File layout:
//! - Header: magic `GTMNODES` (8 bytes) + format version (u32)
//! - Records, back to back:
//!   `[begin magic: u32][body length: u32][body][crc32 of body: u32][end magic: u32]`
//!
//! Integers are little-endian. Strings are a u32 byte count followed by UTF-8
//! bytes; a zero count means the field is absent.

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;

use crate::registry::{NodeState, NodeStatus, NodeType, Registration};

/// Magic bytes at the start of a register log
pub const LOG_MAGIC: &[u8; 8] = b"GTMNODES";

/// Register log format version
pub const LOG_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Begin sentinel of a REGISTER record
pub const MAGIC_REGISTER: u32 = 0xeaea_eaea;

/// Begin sentinel of an UNREGISTER record
pub const MAGIC_UNREGISTER: u32 = 0xebeb_ebeb;

/// End sentinel of every record
pub const MAGIC_END: u32 = 0xefef_efef;

/// Sentinels, length and checksum around each body
pub const RECORD_OVERHEAD: usize = 16;

/// Upper bound on a record body; anything larger is garbage
const MAX_BODY_SIZE: u32 = 1024 * 1024;

/// Longest string a record field may carry. Four fields at this size still
/// fit in `MAX_BODY_SIZE`.
pub const MAX_FIELD_LEN: usize = 64 * 1024;

/// Why a record could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The buffer ends before the record does
    #[error("record truncated")]
    Truncated,

    /// The bytes are not a valid record
    #[error("record corrupted: {0}")]
    Corrupt(String),
}

/// Registration event as persisted in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterEntry {
    pub node_type: NodeType,
    pub node_name: String,
    pub port: u32,
    pub proxy_name: Option<String>,
    pub status: NodeStatus,
    pub ip_address: Option<String>,
    pub data_folder: Option<String>,
}

impl RegisterEntry {
    pub fn from_registration(reg: &Registration) -> Self {
        Self {
            node_type: reg.node_type,
            node_name: reg.node_name.clone(),
            port: reg.port,
            proxy_name: reg.proxy_name.clone(),
            status: reg.status,
            ip_address: reg.ip_address.clone(),
            data_folder: reg.data_folder.clone(),
        }
    }

    /// Entry for a live record; the caller holds the record lock
    pub fn from_state(node_type: NodeType, node_name: &str, state: &NodeState) -> Self {
        Self {
            node_type,
            node_name: node_name.to_string(),
            port: state.port,
            proxy_name: state.proxy_name.clone(),
            status: state.status,
            ip_address: state.ip_address.clone(),
            data_folder: state.data_folder.clone(),
        }
    }

    /// Reject entries that would not decode back: a record needs a node name,
    /// and every string must fit in a record body.
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_name.is_empty() {
            return Err(crate::Error::InvalidRegistration(format!(
                "{} with an empty node name",
                self.node_type
            )));
        }

        let fields = [
            ("node name", Some(self.node_name.as_str())),
            ("proxy name", self.proxy_name.as_deref()),
            ("ip address", self.ip_address.as_deref()),
            ("data folder", self.data_folder.as_deref()),
        ];
        for (field, value) in fields {
            let len = value.map_or(0, str::len);
            if len > MAX_FIELD_LEN {
                return Err(crate::Error::InvalidRegistration(format!(
                    "{} of {} {} is {} bytes, limit is {}",
                    field, self.node_type, self.node_name, len, MAX_FIELD_LEN
                )));
            }
        }
        Ok(())
    }

    /// Registration to replay at startup. No connection owns a restored node
    /// until it registers again, so it comes back disconnected.
    pub fn into_registration(self) -> Registration {
        let mut reg = Registration::new(self.node_type, self.node_name);
        reg.port = self.port;
        reg.proxy_name = self.proxy_name;
        reg.status = NodeStatus::Disconnected;
        reg.ip_address = self.ip_address;
        reg.data_folder = self.data_folder;
        reg
    }
}

/// One register log event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Register(RegisterEntry),
    Unregister { node_type: NodeType, node_name: String },
}

impl LogRecord {
    pub fn node_type(&self) -> NodeType {
        match self {
            LogRecord::Register(entry) => entry.node_type,
            LogRecord::Unregister { node_type, .. } => *node_type,
        }
    }

    pub fn node_name(&self) -> &str {
        match self {
            LogRecord::Register(entry) => &entry.node_name,
            LogRecord::Unregister { node_name, .. } => node_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Register(_) => "REGISTER",
            LogRecord::Unregister { .. } => "UNREGISTER",
        }
    }

    fn begin_magic(&self) -> u32 {
        match self {
            LogRecord::Register(_) => MAGIC_REGISTER,
            LogRecord::Unregister { .. } => MAGIC_UNREGISTER,
        }
    }
}

/// Serialize the file header
pub fn encode_header() -> [u8; HEADER_SIZE] {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0..8].copy_from_slice(LOG_MAGIC);
    bytes[8..12].copy_from_slice(&LOG_VERSION.to_le_bytes());
    bytes
}

/// Check the file header
pub fn decode_header(bytes: &[u8]) -> Result<(), DecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated);
    }
    if &bytes[0..8] != LOG_MAGIC {
        return Err(DecodeError::Corrupt("invalid register log magic".into()));
    }

    let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if version != LOG_VERSION {
        return Err(DecodeError::Corrupt(format!(
            "unsupported register log version: {}",
            version
        )));
    }
    Ok(())
}

/// Serialize one framed record
pub fn encode_record(record: &LogRecord) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    match record {
        LogRecord::Register(entry) => {
            put_u32(&mut body, entry.node_type.as_u32());
            put_str(&mut body, Some(&entry.node_name));
            put_u32(&mut body, entry.port);
            put_str(&mut body, entry.proxy_name.as_deref());
            put_u32(&mut body, entry.status.as_u32());
            put_str(&mut body, entry.ip_address.as_deref());
            put_str(&mut body, entry.data_folder.as_deref());
        }
        LogRecord::Unregister {
            node_type,
            node_name,
        } => {
            put_u32(&mut body, node_type.as_u32());
            put_str(&mut body, Some(node_name));
        }
    }

    let mut out = Vec::with_capacity(body.len() + RECORD_OVERHEAD);
    put_u32(&mut out, record.begin_magic());
    put_u32(&mut out, body.len() as u32);
    out.extend_from_slice(&body);
    put_u32(&mut out, crc32fast::hash(&body));
    put_u32(&mut out, MAGIC_END);
    out
}

/// Decode the record at the start of `buf`.
///
/// Returns the record and the number of bytes it occupies.
pub fn decode_record(buf: &[u8]) -> Result<(LogRecord, usize), DecodeError> {
    let mut cursor = Cursor::new(buf);

    let begin = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    if begin != MAGIC_REGISTER && begin != MAGIC_UNREGISTER {
        return Err(DecodeError::Corrupt(format!("bad begin sentinel {:#010x}", begin)));
    }

    let body_len = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    if body_len > MAX_BODY_SIZE {
        return Err(DecodeError::Corrupt(format!("body length {} too large", body_len)));
    }

    let total = body_len as usize + RECORD_OVERHEAD;
    if buf.len() < total {
        return Err(DecodeError::Truncated);
    }

    let body = &buf[8..8 + body_len as usize];
    cursor.set_position(8 + body_len as u64);
    let checksum = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let end = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

    if end != MAGIC_END {
        return Err(DecodeError::Corrupt(format!("bad end sentinel {:#010x}", end)));
    }
    if checksum != crc32fast::hash(body) {
        return Err(DecodeError::Corrupt("checksum mismatch".into()));
    }

    let record = decode_body(begin, body)?;
    Ok((record, total))
}

fn decode_body(begin: u32, body: &[u8]) -> Result<LogRecord, DecodeError> {
    let mut body = Cursor::new(body);

    let node_type = NodeType::from_u32(get_u32(&mut body)?)
        .ok_or_else(|| DecodeError::Corrupt("unknown node type".into()))?;
    let node_name = get_str(&mut body)?
        .ok_or_else(|| DecodeError::Corrupt("missing node name".into()))?;

    let record = if begin == MAGIC_REGISTER {
        let port = get_u32(&mut body)?;
        let proxy_name = get_str(&mut body)?;
        let status = NodeStatus::from_u32(get_u32(&mut body)?)
            .ok_or_else(|| DecodeError::Corrupt("unknown node status".into()))?;
        let ip_address = get_str(&mut body)?;
        let data_folder = get_str(&mut body)?;
        LogRecord::Register(RegisterEntry {
            node_type,
            node_name,
            port,
            proxy_name,
            status,
            ip_address,
            data_folder,
        })
    } else {
        LogRecord::Unregister {
            node_type,
            node_name,
        }
    };

    if body.position() != body.get_ref().len() as u64 {
        return Err(DecodeError::Corrupt("trailing bytes in record body".into()));
    }
    Ok(record)
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(s) => {
            put_u32(out, s.len() as u32);
            out.extend_from_slice(s.as_bytes());
        }
        None => put_u32(out, 0),
    }
}

// Inside a checksummed body every field must be present
fn get_u32(body: &mut Cursor<&[u8]>) -> Result<u32, DecodeError> {
    body.read_u32::<LittleEndian>()
        .map_err(|_| DecodeError::Corrupt("record body too short".into()))
}

fn get_str(body: &mut Cursor<&[u8]>) -> Result<Option<String>, DecodeError> {
    let len = get_u32(body)? as usize;
    if len == 0 {
        return Ok(None);
    }

    let remaining = body.get_ref().len() as u64 - body.position();
    if len as u64 > remaining {
        return Err(DecodeError::Corrupt("string length exceeds record body".into()));
    }

    let mut bytes = vec![0u8; len];
    body.read_exact(&mut bytes)
        .map_err(|_| DecodeError::Corrupt("record body too short".into()))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| DecodeError::Corrupt("string is not valid UTF-8".into()))
}

fn truncated(_: io::Error) -> DecodeError {
    DecodeError::Truncated
}
