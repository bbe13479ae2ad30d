//! Shared protocol constants for the CloudVault transport

// Handshake limits. Every declared length is checked against these before a
// buffer is sized to it.
pub const MAX_USERNAME_LEN: usize = 30;
pub const MAX_CERTIFICATE_SIZE: usize = 5 * 1024;
pub const MAX_EPHEMERAL_KEY_SIZE: usize = 2048;

// Raw ECDSA P-256 signature (r || s)
pub const SIGNATURE_LEN: usize = 64;
// 64 bytes of signature + one full PKCS#7 padding block
pub const ENCRYPTED_SIGNATURE_SIZE: usize = 80;
pub const CBC_IV_LEN: usize = 16;

pub const SESSION_KEY_LEN: usize = 16;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const COUNTER_LEN: usize = 4;

// Frames per direction before the session must be re-established
pub const COUNTER_LIMIT: u32 = i32::MAX as u32;

// File limits
pub const MAX_FILE_NAME: usize = 255; // linux file name length limit
pub const FILE_NAME_FIELD: usize = MAX_FILE_NAME + 1;
pub const MAX_FILE_CHUNK: usize = 128 * 1024;
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;
// Upper bound on the comma separated listing sent in a single LIST_DATA chunk
pub const MAX_LIST_SIZE: usize = 4 * 1024 * 1024;

// Fixed plaintext sizes. Every request is padded to REQUEST_LEN so the server
// can read the next one without knowing its kind.
pub const REQUEST_LEN: usize = 1 + 2 * FILE_NAME_FIELD;
pub const ACK_LEN: usize = 1 + 1 + 4;

// Command codes (first byte of every plaintext payload)
pub mod command {
    pub const ACK: u8 = 0;
    pub const UPLOAD_REQ: u8 = 1;
    pub const UPLOAD_CHUNK: u8 = 2;
    pub const DOWNLOAD_REQ: u8 = 3;
    pub const DOWNLOAD_CHUNK: u8 = 4;
    pub const LIST_REQ: u8 = 5;
    pub const LIST_DATA: u8 = 6;
    pub const RENAME_REQ: u8 = 7;
    pub const DELETE_REQ: u8 = 8;
    pub const LOGOUT_REQ: u8 = 9;
}

// Ack result codes, per operation
pub mod ack {
    pub mod upload {
        pub const ACCEPTED: u8 = 0;
        pub const ALREADY_EXISTS: u8 = 1;
        pub const REFUSED: u8 = 2;
        // final ack after the chunk stream
        pub const STORED: u8 = 0;
        pub const STORE_FAILED: u8 = 1;
    }
    pub mod download {
        pub const OK: u8 = 0;
        pub const MISSING_OR_EMPTY: u8 = 1;
        pub const UNREADABLE: u8 = 2;
    }
    pub mod list {
        pub const OK: u8 = 0;
        pub const FAILED: u8 = 1;
    }
    // Shared by rename and delete
    pub mod modify {
        pub const OK: u8 = 0;
        pub const FAILED: u8 = 1;
        pub const NOT_FOUND: u8 = 2;
    }
}

// Centralized timeout defaults
pub mod timeouts {
    // Blocking read/write timeout applied to every socket (seconds, 0 = none)
    pub const IO_DEFAULT_SECS: u64 = 300;

    // Connection establishment timeout (seconds)
    pub const CONNECT_SECS: u64 = 10;

    pub fn io_timeout(secs: u64) -> Option<std::time::Duration> {
        if secs == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(secs))
        }
    }
}

pub const DEFAULT_PORT: u16 = 8080;
