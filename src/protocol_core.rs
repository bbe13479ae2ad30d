//! Shared low-level helpers used by both the client and the daemon
//!
//! Exact-length socket I/O, the size-prefixed fields of the handshake, and
//! confinement of remote file names under a storage root.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::MAX_FILE_NAME;

/// Validate a declared length against its cap before anything is allocated.
pub fn validate_declared_len(what: &'static str, len: u64, max: usize) -> ProtocolResult<usize> {
    if len > max as u64 {
        return Err(ProtocolError::OversizedMessage {
            what,
            len,
            max: max as u64,
        });
    }
    Ok(len as usize)
}

/// Read exactly `n` bytes or fail. Short reads surface as `TransportFailure`.
pub fn read_exact_vec<R: Read>(stream: &mut R, n: usize) -> ProtocolResult<Vec<u8>> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_all<W: Write>(stream: &mut W, data: &[u8]) -> ProtocolResult<()> {
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

/// `size_t` fields travel as 64-bit big-endian integers.
pub fn write_size<W: Write>(stream: &mut W, n: u64) -> ProtocolResult<()> {
    write_all(stream, &n.to_be_bytes())
}

pub fn read_size<R: Read>(stream: &mut R) -> ProtocolResult<u64> {
    let mut b = [0u8; 8];
    stream.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

/// Write `len | bytes`.
pub fn write_sized<W: Write>(stream: &mut W, data: &[u8]) -> ProtocolResult<()> {
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.extend_from_slice(&(data.len() as u64).to_be_bytes());
    buf.extend_from_slice(data);
    write_all(stream, &buf)
}

/// Read `len | bytes`, rejecting `len > max` before sizing any buffer.
pub fn read_sized<R: Read>(stream: &mut R, what: &'static str, max: usize) -> ProtocolResult<Vec<u8>> {
    let declared = read_size(stream)?;
    let len = validate_declared_len(what, declared, max)?;
    read_exact_vec(stream, len)
}

/// Check that `name` is a single, plain file name.
///
/// Rejects empty names, names over MAX_FILE_NAME bytes, NUL bytes, path
/// separators and the `.`/`..` entries.
pub fn validate_file_name(name: &str) -> ProtocolResult<()> {
    if name.is_empty() {
        return Err(ProtocolError::InvalidInput("empty file name".into()));
    }
    if name.len() > MAX_FILE_NAME {
        return Err(ProtocolError::InvalidInput(format!(
            "file name is {} bytes (max {})",
            name.len(),
            MAX_FILE_NAME
        )));
    }
    if name.contains('\0') {
        return Err(ProtocolError::InvalidInput("file name contains NUL byte".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ProtocolError::InvalidInput(format!(
            "file name {:?} contains a path separator",
            name
        )));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(ProtocolError::InvalidInput(format!(
            "file name {:?} is not a plain name",
            name
        ))),
    }
}

/// Join a validated file name onto `root`. The result never escapes `root`.
pub fn resolve_under_root(root: &Path, name: &str) -> ProtocolResult<PathBuf> {
    validate_file_name(name)?;
    let joined = root.join(name);
    if !joined.starts_with(root) {
        return Err(ProtocolError::InvalidInput(format!(
            "path {:?} escapes root {:?}",
            name, root
        )));
    }
    Ok(joined)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> ProtocolResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| ProtocolError::filesystem(path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_sized_field_round_trip() {
        let mut wire = Vec::new();
        write_sized(&mut wire, b"alice").unwrap();
        assert_eq!(&wire[..8], &5u64.to_be_bytes());

        let mut rd = Cursor::new(wire);
        let got = read_sized(&mut rd, "username", 30).unwrap();
        assert_eq!(got, b"alice");
    }

    #[test]
    fn test_oversized_declared_length_rejected_before_read() {
        // Declares 1 GiB but carries nothing: must fail on the cap, not on EOF
        let mut wire = Vec::new();
        write_size(&mut wire, 1 << 30).unwrap();
        let mut rd = Cursor::new(wire);
        match read_sized(&mut rd, "certificate", 5120) {
            Err(ProtocolError::OversizedMessage { what, len, max }) => {
                assert_eq!(what, "certificate");
                assert_eq!(len, 1 << 30);
                assert_eq!(max, 5120);
            }
            other => panic!("expected OversizedMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_short_read_is_transport_failure() {
        let mut wire = Vec::new();
        write_size(&mut wire, 10).unwrap();
        wire.extend_from_slice(b"abc");
        let mut rd = Cursor::new(wire);
        assert!(matches!(
            read_sized(&mut rd, "key", 2048),
            Err(ProtocolError::TransportFailure(_))
        ));
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name(".hidden").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name(".").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("dir/file").is_err());
        assert!(validate_file_name("dir\\file").is_err());
        assert!(validate_file_name("file\0.txt").is_err());
        assert!(validate_file_name(&"a".repeat(MAX_FILE_NAME)).is_ok());
        assert!(validate_file_name(&"a".repeat(MAX_FILE_NAME + 1)).is_err());
    }

    #[test]
    fn test_resolve_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let p = resolve_under_root(root, "notes.txt").unwrap();
        assert!(p.starts_with(root));
        assert!(p.ends_with("notes.txt"));

        assert!(resolve_under_root(root, "/etc/passwd").is_err());
        assert!(resolve_under_root(root, "..").is_err());
    }

    #[test]
    fn test_ensure_dir_exists() {
        let temp_dir = TempDir::new().unwrap();
        let new_dir = temp_dir.path().join("data").join("alice");

        assert!(!new_dir.exists());
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.is_dir());

        // idempotent
        ensure_dir_exists(&new_dir).unwrap();
    }
}
