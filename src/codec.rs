//! Fixed-layout plaintext messages
//!
//! Layouts (all integers big-endian):
//!
//! ```text
//! Request   code(1) | fields...                  | zero pad to REQUEST_LEN
//!   Upload    code | name(256) | size u32
//!   Download  code | name(256)
//!   List      code
//!   Rename    code | from(256) | to(256)
//!   Delete    code | name(256)
//!   Logout    code
//! Ack       code=0 | result u8 | size u32        (ACK_LEN)
//! Chunk     code | bytes
//! ServerLogin  key(MAX_EPHEMERAL_KEY_SIZE, zero padded) | key_len i32 | enc_sig(80) | iv(16)
//! ClientLogin  enc_sig(80) | iv(16)
//! ```
//!
//! Every decode path range-checks declared lengths against the buffer.

use std::fmt;

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{
    command, ACK_LEN, CBC_IV_LEN, ENCRYPTED_SIGNATURE_SIZE, FILE_NAME_FIELD, MAX_EPHEMERAL_KEY_SIZE,
    REQUEST_LEN,
};
use crate::protocol_core::validate_file_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Upload,
    Download,
    List,
    Rename,
    Delete,
    Logout,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::List => "list",
            OperationKind::Rename => "rename",
            OperationKind::Delete => "delete",
            OperationKind::Logout => "logout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Upload { name: String, size: u32 },
    Download { name: String },
    List,
    Rename { from: String, to: String },
    Delete { name: String },
    Logout,
}

impl Request {
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Upload { .. } => OperationKind::Upload,
            Request::Download { .. } => OperationKind::Download,
            Request::List => OperationKind::List,
            Request::Rename { .. } => OperationKind::Rename,
            Request::Delete { .. } => OperationKind::Delete,
            Request::Logout => OperationKind::Logout,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Request::Upload { .. } => command::UPLOAD_REQ,
            Request::Download { .. } => command::DOWNLOAD_REQ,
            Request::List => command::LIST_REQ,
            Request::Rename { .. } => command::RENAME_REQ,
            Request::Delete { .. } => command::DELETE_REQ,
            Request::Logout => command::LOGOUT_REQ,
        }
    }

    /// Encode into a REQUEST_LEN buffer. Invalid names are rejected here so
    /// nothing malformed ever reaches the wire.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = vec![0u8; REQUEST_LEN];
        buf[0] = self.code();
        match self {
            Request::Upload { name, size } => {
                put_name(&mut buf[1..1 + FILE_NAME_FIELD], name)?;
                let off = 1 + FILE_NAME_FIELD;
                buf[off..off + 4].copy_from_slice(&size.to_be_bytes());
            }
            Request::Download { name } | Request::Delete { name } => {
                put_name(&mut buf[1..1 + FILE_NAME_FIELD], name)?;
            }
            Request::Rename { from, to } => {
                put_name(&mut buf[1..1 + FILE_NAME_FIELD], from)?;
                put_name(&mut buf[1 + FILE_NAME_FIELD..1 + 2 * FILE_NAME_FIELD], to)?;
            }
            Request::List | Request::Logout => {}
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() != REQUEST_LEN {
            return Err(ProtocolError::malformed(format!(
                "request is {} bytes, expected {}",
                buf.len(),
                REQUEST_LEN
            )));
        }
        let first = &buf[1..1 + FILE_NAME_FIELD];
        let second = &buf[1 + FILE_NAME_FIELD..1 + 2 * FILE_NAME_FIELD];
        let req = match buf[0] {
            command::UPLOAD_REQ => {
                let off = 1 + FILE_NAME_FIELD;
                let size = u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
                Request::Upload {
                    name: get_name(first)?,
                    size,
                }
            }
            command::DOWNLOAD_REQ => Request::Download {
                name: get_name(first)?,
            },
            command::LIST_REQ => Request::List,
            command::RENAME_REQ => Request::Rename {
                from: get_name(first)?,
                to: get_name(second)?,
            },
            command::DELETE_REQ => Request::Delete {
                name: get_name(first)?,
            },
            command::LOGOUT_REQ => Request::Logout,
            other => {
                return Err(ProtocolError::malformed(format!(
                    "unknown request command code {}",
                    other
                )))
            }
        };
        Ok(req)
    }
}

/// NUL-padded fixed-width name field
fn put_name(field: &mut [u8], name: &str) -> ProtocolResult<()> {
    validate_file_name(name)?;
    // validate_file_name bounds the length to FILE_NAME_FIELD - 1
    field[..name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}

fn get_name(field: &[u8]) -> ProtocolResult<String> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProtocolError::malformed("file name field is not NUL terminated"))?;
    let name = std::str::from_utf8(&field[..end])
        .map_err(|_| ProtocolError::malformed("file name is not valid UTF-8"))?;
    validate_file_name(name).map_err(|e| ProtocolError::malformed(e.to_string()))?;
    Ok(name.to_string())
}

/// Server acknowledgement. `size` carries the file size (download) or the
/// listing length (list) and is zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub result: u8,
    pub size: u32,
}

impl Ack {
    pub fn new(result: u8) -> Self {
        Self { result, size: 0 }
    }

    pub fn with_size(result: u8, size: u32) -> Self {
        Self { result, size }
    }

    pub fn encode(&self) -> [u8; ACK_LEN] {
        let mut buf = [0u8; ACK_LEN];
        buf[0] = command::ACK;
        buf[1] = self.result;
        buf[2..6].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() != ACK_LEN {
            return Err(ProtocolError::malformed(format!(
                "ack is {} bytes, expected {}",
                buf.len(),
                ACK_LEN
            )));
        }
        if buf[0] != command::ACK {
            return Err(ProtocolError::malformed(format!(
                "expected ack, got command code {}",
                buf[0]
            )));
        }
        Ok(Self {
            result: buf[1],
            size: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }
}

/// Bulk data: UPLOAD_CHUNK, DOWNLOAD_CHUNK or LIST_DATA.
pub struct Chunk;

impl Chunk {
    pub fn encoded_len(data_len: usize) -> usize {
        1 + data_len
    }

    pub fn encode(code: u8, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + data.len());
        buf.push(code);
        buf.extend_from_slice(data);
        buf
    }

    /// Strip and check the command code; the data length is fixed by the
    /// envelope read that produced `buf`.
    pub fn decode(expected_code: u8, buf: &[u8]) -> ProtocolResult<&[u8]> {
        match buf.split_first() {
            Some((&code, data)) if code == expected_code => Ok(data),
            Some((&code, _)) => Err(ProtocolError::malformed(format!(
                "expected chunk code {}, got {}",
                expected_code, code
            ))),
            None => Err(ProtocolError::malformed("empty chunk")),
        }
    }
}

pub const SERVER_LOGIN_LEN: usize =
    MAX_EPHEMERAL_KEY_SIZE + 4 + ENCRYPTED_SIGNATURE_SIZE + CBC_IV_LEN;
pub const CLIENT_LOGIN_LEN: usize = ENCRYPTED_SIGNATURE_SIZE + CBC_IV_LEN;

/// Server's ephemeral key plus its encrypted transcript signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLogin {
    pub ephemeral_key: Vec<u8>,
    pub encrypted_signature: [u8; ENCRYPTED_SIGNATURE_SIZE],
    pub iv: [u8; CBC_IV_LEN],
}

impl ServerLogin {
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let key_len = self.ephemeral_key.len();
        if key_len > MAX_EPHEMERAL_KEY_SIZE {
            return Err(ProtocolError::OversizedMessage {
                what: "ephemeral key",
                len: key_len as u64,
                max: MAX_EPHEMERAL_KEY_SIZE as u64,
            });
        }
        let mut buf = vec![0u8; SERVER_LOGIN_LEN];
        buf[..key_len].copy_from_slice(&self.ephemeral_key);
        let mut off = MAX_EPHEMERAL_KEY_SIZE;
        buf[off..off + 4].copy_from_slice(&(key_len as i32).to_be_bytes());
        off += 4;
        buf[off..off + ENCRYPTED_SIGNATURE_SIZE].copy_from_slice(&self.encrypted_signature);
        off += ENCRYPTED_SIGNATURE_SIZE;
        buf[off..off + CBC_IV_LEN].copy_from_slice(&self.iv);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() != SERVER_LOGIN_LEN {
            return Err(ProtocolError::malformed(format!(
                "server login is {} bytes, expected {}",
                buf.len(),
                SERVER_LOGIN_LEN
            )));
        }
        let mut off = MAX_EPHEMERAL_KEY_SIZE;
        let declared = i32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        if declared <= 0 {
            return Err(ProtocolError::malformed(format!(
                "invalid ephemeral key length {}",
                declared
            )));
        }
        if declared as usize > MAX_EPHEMERAL_KEY_SIZE {
            return Err(ProtocolError::OversizedMessage {
                what: "ephemeral key",
                len: declared as u64,
                max: MAX_EPHEMERAL_KEY_SIZE as u64,
            });
        }
        let ephemeral_key = buf[..declared as usize].to_vec();
        off += 4;
        let mut encrypted_signature = [0u8; ENCRYPTED_SIGNATURE_SIZE];
        encrypted_signature.copy_from_slice(&buf[off..off + ENCRYPTED_SIGNATURE_SIZE]);
        off += ENCRYPTED_SIGNATURE_SIZE;
        let mut iv = [0u8; CBC_IV_LEN];
        iv.copy_from_slice(&buf[off..off + CBC_IV_LEN]);
        Ok(Self {
            ephemeral_key,
            encrypted_signature,
            iv,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLogin {
    pub encrypted_signature: [u8; ENCRYPTED_SIGNATURE_SIZE],
    pub iv: [u8; CBC_IV_LEN],
}

impl ClientLogin {
    pub fn encode(&self) -> [u8; CLIENT_LOGIN_LEN] {
        let mut buf = [0u8; CLIENT_LOGIN_LEN];
        buf[..ENCRYPTED_SIGNATURE_SIZE].copy_from_slice(&self.encrypted_signature);
        buf[ENCRYPTED_SIGNATURE_SIZE..].copy_from_slice(&self.iv);
        buf
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() != CLIENT_LOGIN_LEN {
            return Err(ProtocolError::malformed(format!(
                "client login is {} bytes, expected {}",
                buf.len(),
                CLIENT_LOGIN_LEN
            )));
        }
        let mut encrypted_signature = [0u8; ENCRYPTED_SIGNATURE_SIZE];
        encrypted_signature.copy_from_slice(&buf[..ENCRYPTED_SIGNATURE_SIZE]);
        let mut iv = [0u8; CBC_IV_LEN];
        iv.copy_from_slice(&buf[ENCRYPTED_SIGNATURE_SIZE..]);
        Ok(Self {
            encrypted_signature,
            iv,
        })
    }
}
