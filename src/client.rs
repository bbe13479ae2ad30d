//! Client connection session
//!
//! Owns the socket, the session key and both counters for one logical
//! connection and drives one operation at a time through the envelope.

use p256::ecdsa::SigningKey;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::{Ack, Chunk, OperationKind, Request};
use crate::envelope::SecureChannel;
use crate::error::{ProtocolError, ProtocolResult};
use crate::handshake::{client_handshake, validate_username};
use crate::pki::TrustStore;
use crate::protocol::{
    ack, command, timeouts, ACK_LEN, COUNTER_LIMIT, MAX_FILE_SIZE, MAX_LIST_SIZE,
};
use crate::protocol_core::validate_file_name;
use crate::store::{DiskStore, FileStore};
use crate::transfer::{ChunkPlan, ProgressObserver, Transfer, TransferProgress, TransferState};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub io_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Frames per direction before a re-handshake is forced
    pub counter_limit: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            io_timeout: timeouts::io_timeout(timeouts::IO_DEFAULT_SECS),
            connect_timeout: Duration::from_secs(timeouts::CONNECT_SECS),
            counter_limit: COUNTER_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Operation {
    /// Upload a local file; `remote_name` defaults to its file name
    Upload {
        source: PathBuf,
        remote_name: Option<String>,
    },
    /// Download into `dest_dir`, keeping the remote name
    Download { name: String, dest_dir: PathBuf },
    List,
    Rename { from: String, to: String },
    Delete { name: String },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Upload { .. } => OperationKind::Upload,
            Operation::Download { .. } => OperationKind::Download,
            Operation::List => OperationKind::List,
            Operation::Rename { .. } => OperationKind::Rename,
            Operation::Delete { .. } => OperationKind::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Uploaded { name: String, bytes: u64 },
    Downloaded { path: PathBuf, bytes: u64 },
    Listed(Vec<String>),
    Renamed,
    Deleted,
}

/// Validated, locally prepared form of an [`Operation`]; nothing here has
/// touched the wire yet.
enum Prepared {
    Upload {
        local: DiskStore,
        local_name: String,
        remote_name: String,
        size: u32,
    },
    Download {
        local: DiskStore,
        name: String,
    },
    List,
    Rename {
        from: String,
        to: String,
    },
    Delete {
        name: String,
    },
}

impl Prepared {
    /// (frames sent, frames received) the exchange can need at most.
    fn frame_budget(&self) -> (u64, u64) {
        match self {
            Prepared::Upload { size, .. } => (1 + ChunkPlan::for_file(u64::from(*size)).frame_count(), 2),
            // size unknown until the ack arrives
            Prepared::Download { .. } => (1, 1 + ChunkPlan::for_file(MAX_FILE_SIZE).frame_count()),
            Prepared::List => (1, 2),
            Prepared::Rename { .. } | Prepared::Delete { .. } => (1, 1),
        }
    }
}

fn prepare(op: Operation) -> ProtocolResult<Prepared> {
    match op {
        Operation::Upload {
            source,
            remote_name,
        } => {
            let local_name = source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    ProtocolError::InvalidInput(format!("{} has no file name", source.display()))
                })?
                .to_string();
            let remote_name = remote_name.unwrap_or_else(|| local_name.clone());
            validate_file_name(&remote_name)?;
            let dir = match source.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let local = DiskStore::new(dir);
            if !local.exists(&local_name)? {
                return Err(ProtocolError::filesystem(
                    &source,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                ));
            }
            let size = local.size(&local_name)?;
            if size == 0 {
                return Err(ProtocolError::InvalidInput(format!(
                    "{} is empty",
                    source.display()
                )));
            }
            if size > MAX_FILE_SIZE {
                return Err(ProtocolError::InvalidInput(format!(
                    "{} is {} bytes (max {})",
                    source.display(),
                    size,
                    MAX_FILE_SIZE
                )));
            }
            Ok(Prepared::Upload {
                local,
                local_name,
                remote_name,
                size: size as u32,
            })
        }
        Operation::Download { name, dest_dir } => {
            validate_file_name(&name)?;
            if !dest_dir.is_dir() {
                return Err(ProtocolError::InvalidInput(format!(
                    "{} is not a directory",
                    dest_dir.display()
                )));
            }
            let target = dest_dir.join(&name);
            if target.exists() {
                return Err(ProtocolError::InvalidInput(format!(
                    "{} already exists locally",
                    target.display()
                )));
            }
            Ok(Prepared::Download {
                local: DiskStore::new(dest_dir),
                name,
            })
        }
        Operation::List => Ok(Prepared::List),
        Operation::Rename { from, to } => {
            validate_file_name(&from)?;
            validate_file_name(&to)?;
            Ok(Prepared::Rename { from, to })
        }
        Operation::Delete { name } => {
            validate_file_name(&name)?;
            Ok(Prepared::Delete { name })
        }
    }
}

fn rejected(operation: OperationKind, code: u8) -> ProtocolError {
    let reason = match (operation, code) {
        (OperationKind::Upload, ack::upload::ALREADY_EXISTS) => "file already exists",
        (OperationKind::Upload, ack::upload::REFUSED) => "upload refused",
        (OperationKind::Download, ack::download::MISSING_OR_EMPTY) => "file missing or empty",
        (OperationKind::Download, ack::download::UNREADABLE) => "file unreadable",
        (OperationKind::List, _) => "listing failed",
        (OperationKind::Rename | OperationKind::Delete, ack::modify::NOT_FOUND) => {
            "file does not exist"
        }
        (OperationKind::Rename | OperationKind::Delete, ack::modify::FAILED) => "operation failed",
        _ => "unexpected result code",
    };
    ProtocolError::OperationRejected {
        operation,
        code,
        reason,
    }
}

fn recv_ack<S: Read + Write>(ch: &mut SecureChannel<S>) -> ProtocolResult<Ack> {
    Ack::decode(&ch.recv(ACK_LEN)?)
}

/// Drives one prepared operation. `synced` is cleared before the first
/// frame goes out and set again once every frame the exchange involves has
/// crossed, so an error while it is set leaves the counters aligned.
fn exchange<S: Read + Write>(
    ch: &mut SecureChannel<S>,
    op: Prepared,
    progress: &mut dyn ProgressObserver,
    synced: &mut bool,
) -> ProtocolResult<OperationOutcome> {
    match op {
        Prepared::Upload {
            local,
            local_name,
            remote_name,
            size,
        } => {
            let mut t = Transfer::new(OperationKind::Upload);
            let mut reader = local.open_for_chunked_read(&local_name)?;
            *synced = false;
            ch.send(&Request::Upload {
                name: remote_name.clone(),
                size,
            }
            .encode()?)?;
            t.advance(TransferState::SentRequest)?;

            let a = recv_ack(ch)?;
            if a.result != ack::upload::ACCEPTED {
                t.advance(TransferState::Rejected)?;
                *synced = true;
                return Err(rejected(OperationKind::Upload, a.result));
            }
            t.advance(TransferState::Accepted)?;

            t.advance(TransferState::SendingChunks)?;
            let plan = ChunkPlan::for_file(u64::from(size));
            let mut p = TransferProgress::new(plan.total_size, plan.chunk_size);
            progress.started(OperationKind::Upload, &remote_name, plan.total_size);
            for n in plan.chunk_sizes() {
                let data = local.read_chunk(&mut reader, n)?;
                ch.send(&Chunk::encode(command::UPLOAD_CHUNK, &data))?;
                p.record(n)?;
                progress.advanced(&p);
            }

            t.advance(TransferState::AwaitingFinalAck)?;
            let fin = recv_ack(ch)?;
            *synced = true;
            progress.finished(&p);
            if fin.result != ack::upload::STORED {
                t.fail();
                return Err(ProtocolError::OperationRejected {
                    operation: OperationKind::Upload,
                    code: fin.result,
                    reason: "server failed to store file",
                });
            }
            t.advance(TransferState::Done)?;
            Ok(OperationOutcome::Uploaded {
                name: remote_name,
                bytes: p.bytes_transferred,
            })
        }

        Prepared::Download { local, name } => {
            let mut t = Transfer::new(OperationKind::Download);
            *synced = false;
            ch.send(&Request::Download { name: name.clone() }.encode()?)?;
            t.advance(TransferState::SentRequest)?;

            let a = recv_ack(ch)?;
            if a.result != ack::download::OK {
                t.advance(TransferState::Rejected)?;
                *synced = true;
                return Err(rejected(OperationKind::Download, a.result));
            }
            if a.size == 0 {
                t.fail();
                return Err(ProtocolError::malformed("download accepted with zero size"));
            }
            t.advance(TransferState::Accepted)?;

            // pre-create the destination before any chunk is consumed; an
            // existing file is left alone and the chunks are still drained
            let mut writer = local.open_for_chunked_write(&name);
            let plan = ChunkPlan::for_file(u64::from(a.size));
            let mut p = TransferProgress::new(plan.total_size, plan.chunk_size);
            t.advance(TransferState::ReceivingChunks)?;
            progress.started(OperationKind::Download, &name, plan.total_size);
            for n in plan.chunk_sizes() {
                // a receive failure aborts here; bytes already written stay on disk
                let raw = ch.recv(Chunk::encoded_len(n))?;
                let data = Chunk::decode(command::DOWNLOAD_CHUNK, &raw)?;
                if let Ok(w) = writer.as_mut() {
                    if let Err(e) = local.write_chunk(w, data) {
                        writer = Err(e);
                    }
                }
                p.record(n)?;
                progress.advanced(&p);
            }
            *synced = true;
            progress.finished(&p);
            local.finish(writer?)?;
            t.advance(TransferState::Done)?;
            Ok(OperationOutcome::Downloaded {
                path: local.root().join(&name),
                bytes: p.bytes_transferred,
            })
        }

        Prepared::List => {
            let mut t = Transfer::new(OperationKind::List);
            *synced = false;
            ch.send(&Request::List.encode()?)?;
            t.advance(TransferState::SentRequest)?;

            let a = recv_ack(ch)?;
            if a.result != ack::list::OK {
                t.advance(TransferState::Rejected)?;
                *synced = true;
                return Err(rejected(OperationKind::List, a.result));
            }
            if a.size as usize > MAX_LIST_SIZE {
                return Err(ProtocolError::OversizedMessage {
                    what: "file listing",
                    len: u64::from(a.size),
                    max: MAX_LIST_SIZE as u64,
                });
            }
            t.advance(TransferState::Accepted)?;
            t.advance(TransferState::ReceivingChunks)?;
            let raw = ch.recv(Chunk::encoded_len(a.size as usize))?;
            *synced = true;
            let data = Chunk::decode(command::LIST_DATA, &raw)?;
            let text = std::str::from_utf8(data)
                .map_err(|_| ProtocolError::malformed("file listing is not valid UTF-8"))?;
            let names = text
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            t.advance(TransferState::Done)?;
            Ok(OperationOutcome::Listed(names))
        }

        Prepared::Rename { from, to } => {
            modify(ch, OperationKind::Rename, Request::Rename { from, to }, synced)?;
            Ok(OperationOutcome::Renamed)
        }

        Prepared::Delete { name } => {
            modify(ch, OperationKind::Delete, Request::Delete { name }, synced)?;
            Ok(OperationOutcome::Deleted)
        }
    }
}

fn modify<S: Read + Write>(
    ch: &mut SecureChannel<S>,
    kind: OperationKind,
    req: Request,
    synced: &mut bool,
) -> ProtocolResult<()> {
    let mut t = Transfer::new(kind);
    let frame = req.encode()?;
    *synced = false;
    ch.send(&frame)?;
    t.advance(TransferState::SentRequest)?;
    let a = recv_ack(ch)?;
    *synced = true;
    if a.result != ack::modify::OK {
        t.advance(TransferState::Rejected)?;
        return Err(rejected(kind, a.result));
    }
    t.advance(TransferState::Accepted)?;
    t.advance(TransferState::Done)
}

/// One authenticated connection to the daemon.
pub struct Client {
    addr: String,
    username: String,
    trust: TrustStore,
    signing_key: SigningKey,
    opts: ClientOptions,
    channel: Option<SecureChannel<TcpStream>>,
    broken: Option<String>,
    rehandshakes: u64,
}

impl Client {
    /// Connect and authenticate. `unlock` produces the long-term signing
    /// key once the server has confirmed the username.
    pub fn connect<F>(
        addr: &str,
        username: &str,
        trust: TrustStore,
        unlock: F,
        opts: ClientOptions,
    ) -> ProtocolResult<Self>
    where
        F: FnOnce() -> ProtocolResult<SigningKey>,
    {
        validate_username(username)?;
        let stream = open_stream(addr, &opts)?;
        let (channel, signing_key) =
            client_handshake(stream, username, unlock, &trust, opts.counter_limit)?;
        Ok(Self {
            addr: addr.to_string(),
            username: username.to_string(),
            trust,
            signing_key,
            opts,
            channel: Some(channel),
            broken: None,
            rehandshakes: 0,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_usable(&self) -> bool {
        self.channel.is_some()
    }

    /// Number of times the session was re-established after its counters
    /// ran low.
    pub fn rehandshakes(&self) -> u64 {
        self.rehandshakes
    }

    /// Drop the current connection and run a fresh handshake with the
    /// already unlocked key.
    pub fn reconnect(&mut self) -> ProtocolResult<()> {
        self.channel = None;
        let stream = open_stream(&self.addr, &self.opts)?;
        let key = self.signing_key.clone();
        let (channel, _) = client_handshake(
            stream,
            &self.username,
            move || Ok(key),
            &self.trust,
            self.opts.counter_limit,
        )?;
        self.channel = Some(channel);
        self.broken = None;
        Ok(())
    }

    pub fn perform_operation(
        &mut self,
        op: Operation,
        progress: &mut dyn ProgressObserver,
    ) -> ProtocolResult<OperationOutcome> {
        let prepared = prepare(op)?;
        let (send_needed, recv_needed) = prepared.frame_budget();

        let exhausted = |ch: &SecureChannel<TcpStream>| {
            ch.send_remaining() < send_needed || ch.recv_remaining() < recv_needed
        };
        let needs_rehandshake = match &self.channel {
            Some(ch) => exhausted(ch),
            None => {
                return Err(ProtocolError::SessionBroken(
                    self.broken
                        .clone()
                        .unwrap_or_else(|| "not connected".to_string()),
                ))
            }
        };
        if needs_rehandshake {
            self.reconnect()?;
            self.rehandshakes += 1;
        }

        // a fresh session that still cannot carry the exchange
        if self.channel.as_ref().map_or(true, |ch| exhausted(ch)) {
            return Err(ProtocolError::CounterExhausted);
        }
        let Some(ch) = self.channel.as_mut() else {
            return Err(ProtocolError::SessionBroken("not connected".to_string()));
        };
        let mut synced = true;
        let res = exchange(ch, prepared, progress, &mut synced);
        if let Err(e) = &res {
            if !(synced || e.keeps_session()) {
                self.broken = Some(e.to_string());
                self.channel = None;
            }
        }
        res
    }

    /// Tell the server we are done; the connection is closed either way.
    pub fn logout(mut self) -> ProtocolResult<()> {
        match self.channel.take() {
            Some(mut ch) => ch.send(&Request::Logout.encode()?),
            None => Ok(()),
        }
    }
}

fn open_stream(addr: &str, opts: &ClientOptions) -> ProtocolResult<TcpStream> {
    let mut last_err = None;
    for sa in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sa, opts.connect_timeout) {
            Ok(s) => {
                let _ = s.set_nodelay(true);
                s.set_read_timeout(opts.io_timeout)?;
                s.set_write_timeout(opts.io_timeout)?;
                return Ok(s);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(ProtocolError::TransportFailure(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{addr} did not resolve"),
        )
    })))
}

/// Default location of a user's encrypted key under `users_dir`.
pub fn default_key_path(users_dir: &Path, username: &str) -> PathBuf {
    crate::pki::user_private_key_path(users_dir, username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_rejects_empty_upload_locally() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.txt");
        std::fs::write(&path, b"").unwrap();
        let res = prepare(Operation::Upload {
            source: path,
            remote_name: None,
        });
        assert!(matches!(res, Err(ProtocolError::InvalidInput(_))));
    }

    #[test]
    fn test_prepare_missing_source_is_filesystem_failure() {
        let tmp = TempDir::new().unwrap();
        let res = prepare(Operation::Upload {
            source: tmp.path().join("nope.txt"),
            remote_name: None,
        });
        assert!(matches!(res, Err(ProtocolError::FilesystemFailure { .. })));
    }

    #[test]
    fn test_prepare_validates_names() {
        assert!(matches!(
            prepare(Operation::Delete { name: "../x".into() }),
            Err(ProtocolError::InvalidInput(_))
        ));
        assert!(prepare(Operation::Rename {
            from: "a".into(),
            to: "".into()
        })
        .is_err());
        let tmp = TempDir::new().unwrap();
        assert!(prepare(Operation::Download {
            name: "a".into(),
            dest_dir: tmp.path().join("missing-dir"),
        })
        .is_err());
    }

    #[test]
    fn test_download_never_overwrites_local_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("report.pdf"), b"mine").unwrap();
        assert!(matches!(
            prepare(Operation::Download {
                name: "report.pdf".into(),
                dest_dir: tmp.path().to_path_buf(),
            }),
            Err(ProtocolError::InvalidInput(_))
        ));
        assert_eq!(std::fs::read(tmp.path().join("report.pdf")).unwrap(), b"mine");
    }

    #[test]
    fn test_upload_budget_counts_chunks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f.bin");
        std::fs::write(&path, vec![1u8; 300_000]).unwrap();
        let p = prepare(Operation::Upload {
            source: path,
            remote_name: Some("g.bin".into()),
        })
        .unwrap();
        assert_eq!(p.frame_budget(), (4, 2));
        match p {
            Prepared::Upload {
                remote_name, size, ..
            } => {
                assert_eq!(remote_name, "g.bin");
                assert_eq!(size, 300_000);
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_rejection_reasons() {
        let e = rejected(OperationKind::Rename, ack::modify::NOT_FOUND);
        assert!(e.keeps_session());
        assert_eq!(
            e.to_string(),
            "rename rejected by server (code 2): file does not exist"
        );
    }
}
