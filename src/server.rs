//! Daemon side: accept loop, per-connection session and operation handlers
//!
//! One OS thread per accepted connection. Each connection runs exactly one
//! handshake followed by a strictly sequential stream of requests.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::codec::{Ack, Chunk, OperationKind, Request};
use crate::envelope::SecureChannel;
use crate::error::ProtocolResult;
use crate::handshake::server_handshake;
use crate::log::{TransferLog, TransferLogEntry, TransferStatus};
use crate::logger::Logger;
use crate::pki::ServerIdentity;
use crate::protocol::{ack, command, COUNTER_LIMIT, MAX_FILE_SIZE, MAX_LIST_SIZE, REQUEST_LEN};
use crate::registry::IdentityRegistry;
use crate::store::{DiskStore, FileStore};
use crate::transfer::{ChunkPlan, Transfer, TransferProgress, TransferState};

/// Everything a connection thread needs; immutable and shared behind `Arc`.
pub struct ServerContext {
    pub identity: ServerIdentity,
    pub registry: IdentityRegistry,
    pub data_root: PathBuf,
    pub io_timeout: Option<Duration>,
    pub counter_limit: u32,
    pub logger: Arc<dyn Logger>,
    pub journal: Option<TransferLog>,
}

impl ServerContext {
    pub fn new(
        identity: ServerIdentity,
        registry: IdentityRegistry,
        data_root: PathBuf,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            identity,
            registry,
            data_root,
            io_timeout: None,
            counter_limit: COUNTER_LIMIT,
            logger,
            journal: None,
        }
    }
}

pub fn serve(bind: &str, ctx: Arc<ServerContext>) -> Result<()> {
    let listener = TcpListener::bind(bind).with_context(|| format!("bind {}", bind))?;
    ctx.logger
        .listening(bind, &ctx.data_root, ctx.registry.len());
    serve_listener(listener, ctx)
}

/// Accept forever on an already bound listener.
pub fn serve_listener(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || handle_conn(stream, &ctx));
            }
            Err(e) => {
                ctx.logger.error("accept", &e.to_string());
            }
        }
    }
    Ok(())
}

fn tune_socket(stream: &TcpStream, timeout: Option<Duration>) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(timeout);
    let _ = stream.set_write_timeout(timeout);
}

fn handle_conn(stream: TcpStream, ctx: &ServerContext) {
    let peer = match stream.peer_addr() {
        Ok(a) => a,
        Err(e) => {
            ctx.logger.error("peer_addr", &e.to_string());
            return;
        }
    };
    tune_socket(&stream, ctx.io_timeout);
    ctx.logger.connected(peer);

    let (username, channel) =
        match server_handshake(stream, &ctx.identity, &ctx.registry, ctx.counter_limit) {
            Ok(v) => v,
            Err(e) => {
                ctx.logger.handshake_failed(peer, &e.to_string());
                return;
            }
        };
    ctx.logger.authenticated(peer, &username);

    let store = match DiskStore::for_user(&ctx.data_root, &username) {
        Ok(s) => s,
        Err(e) => {
            ctx.logger.error("user storage", &e.to_string());
            return;
        }
    };

    let mut session = Session {
        ctx,
        channel,
        store,
        username,
        session_id: uuid::Uuid::new_v4().to_string(),
    };
    if let Err(e) = session.run() {
        ctx.logger.error(&format!("session {}", session.username), &e.to_string());
    }
    ctx.logger.disconnected(peer, &session.username);
}

/// Result of one served operation, for the log and the journal.
struct Served {
    status: TransferStatus,
    ack_code: Option<u8>,
    bytes: u64,
}

impl Served {
    fn acked(code: u8, ok: u8, bytes: u64) -> Self {
        Self {
            status: if code == ok {
                TransferStatus::Completed
            } else {
                TransferStatus::Rejected
            },
            ack_code: Some(code),
            bytes,
        }
    }
}

struct Session<'a, S, F> {
    ctx: &'a ServerContext,
    channel: SecureChannel<S>,
    store: F,
    username: String,
    session_id: String,
}

impl<'a, S: Read + Write, F: FileStore> Session<'a, S, F> {
    /// Serve requests until logout or disconnect. A disconnect between
    /// requests is a normal end of session.
    fn run(&mut self) -> ProtocolResult<()> {
        loop {
            let raw = match self.channel.recv(REQUEST_LEN) {
                Ok(raw) => raw,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e),
            };
            let req = Request::decode(&raw)?;
            let kind = req.kind();
            let file = match &req {
                Request::Upload { name, .. }
                | Request::Download { name }
                | Request::Delete { name } => Some(name.clone()),
                Request::Rename { from, to } => Some(format!("{from} -> {to}")),
                Request::List | Request::Logout => None,
            };

            let res = match req {
                Request::Upload { name, size } => self.upload(&name, size),
                Request::Download { name } => self.download(&name),
                Request::List => self.list(),
                Request::Rename { from, to } => self.rename(&from, &to),
                Request::Delete { name } => self.delete(&name),
                Request::Logout => {
                    self.record(kind, file.as_deref(), &Ok(Served {
                        status: TransferStatus::Completed,
                        ack_code: None,
                        bytes: 0,
                    }));
                    return Ok(());
                }
            };
            self.record(kind, file.as_deref(), &res);
            res?;
        }
    }

    fn record(&self, kind: OperationKind, file: Option<&str>, res: &ProtocolResult<Served>) {
        let mut entry = TransferLogEntry::new(&self.session_id, &self.username, kind);
        entry.file = file.map(str::to_string);
        let result = match res {
            Ok(s) => {
                entry.status = s.status;
                entry.ack_code = s.ack_code;
                entry.bytes_transferred = s.bytes;
                match s.status {
                    TransferStatus::Completed => "ok".to_string(),
                    _ => format!("rejected({})", s.ack_code.unwrap_or_default()),
                }
            }
            Err(e) => {
                entry.status = TransferStatus::Failed;
                entry.error = Some(e.to_string());
                "failed".to_string()
            }
        };
        self.ctx.logger.operation(
            &self.username,
            kind,
            file.unwrap_or("-"),
            &result,
            entry.bytes_transferred,
        );
        if let Some(journal) = &self.ctx.journal {
            if let Err(e) = journal.add_entry(&entry) {
                self.ctx.logger.error("journal", &e.to_string());
            }
        }
    }

    fn send_ack(&mut self, ack: Ack) -> ProtocolResult<()> {
        self.channel.send(&ack.encode())
    }

    fn upload(&mut self, name: &str, size: u32) -> ProtocolResult<Served> {
        let mut t = Transfer::new(OperationKind::Upload);
        t.advance(TransferState::SentRequest)?;

        let refuse = if size == 0 || u64::from(size) > MAX_FILE_SIZE {
            Some(ack::upload::REFUSED)
        } else if self.store.exists(name)? {
            Some(ack::upload::ALREADY_EXISTS)
        } else {
            None
        };
        if let Some(code) = refuse {
            t.advance(TransferState::Rejected)?;
            self.send_ack(Ack::new(code))?;
            return Ok(Served::acked(code, ack::upload::ACCEPTED, 0));
        }

        let mut writer = match self.store.open_staged_write(name) {
            Ok(w) => Some(w),
            Err(e) => {
                self.ctx.logger.error("upload staging", &e.to_string());
                t.advance(TransferState::Rejected)?;
                self.send_ack(Ack::new(ack::upload::REFUSED))?;
                return Ok(Served::acked(ack::upload::REFUSED, ack::upload::ACCEPTED, 0));
            }
        };
        t.advance(TransferState::Accepted)?;
        self.send_ack(Ack::new(ack::upload::ACCEPTED))?;

        t.advance(TransferState::SendingChunks)?;
        let plan = ChunkPlan::for_file(u64::from(size));
        let mut progress = TransferProgress::new(plan.total_size, plan.chunk_size);
        for n in plan.chunk_sizes() {
            let raw = match self.channel.recv(Chunk::encoded_len(n)) {
                Ok(raw) => raw,
                Err(e) => {
                    if let Some(w) = writer.take() {
                        self.store.discard(w);
                    }
                    t.fail();
                    return Err(e);
                }
            };
            let data = match Chunk::decode(command::UPLOAD_CHUNK, &raw) {
                Ok(d) => d,
                Err(e) => {
                    if let Some(w) = writer.take() {
                        self.store.discard(w);
                    }
                    t.fail();
                    return Err(e);
                }
            };
            // keep draining after a local write failure so counters stay aligned
            if let Some(w) = writer.as_mut() {
                if let Err(e) = self.store.write_chunk(w, data) {
                    self.ctx.logger.error("upload write", &e.to_string());
                    if let Some(w) = writer.take() {
                        self.store.discard(w);
                    }
                }
            }
            progress.record(n)?;
        }

        t.advance(TransferState::AwaitingFinalAck)?;
        let code = match writer {
            Some(w) => match self.store.commit(w, name) {
                Ok(()) => ack::upload::STORED,
                Err(e) => {
                    self.ctx.logger.error("upload commit", &e.to_string());
                    ack::upload::STORE_FAILED
                }
            },
            None => ack::upload::STORE_FAILED,
        };
        self.send_ack(Ack::new(code))?;
        t.advance(TransferState::Done)?;
        Ok(Served::acked(code, ack::upload::STORED, progress.bytes_transferred))
    }

    fn download(&mut self, name: &str) -> ProtocolResult<Served> {
        let mut t = Transfer::new(OperationKind::Download);
        t.advance(TransferState::SentRequest)?;

        let size = if self.store.exists(name)? {
            self.store.size(name)?
        } else {
            0
        };
        let opened = if size == 0 {
            Err(ack::download::MISSING_OR_EMPTY)
        } else if size > MAX_FILE_SIZE {
            Err(ack::download::UNREADABLE)
        } else {
            self.store
                .open_for_chunked_read(name)
                .map_err(|_| ack::download::UNREADABLE)
        };
        let mut reader = match opened {
            Ok(r) => r,
            Err(code) => {
                t.advance(TransferState::Rejected)?;
                self.send_ack(Ack::new(code))?;
                return Ok(Served::acked(code, ack::download::OK, 0));
            }
        };

        t.advance(TransferState::Accepted)?;
        // size <= MAX_FILE_SIZE checked above
        self.send_ack(Ack::with_size(ack::download::OK, size as u32))?;

        t.advance(TransferState::ReceivingChunks)?;
        let plan = ChunkPlan::for_file(size);
        let mut progress = TransferProgress::new(plan.total_size, plan.chunk_size);
        for n in plan.chunk_sizes() {
            // a local read failure here cannot be signalled in-band
            let data = match self.store.read_chunk(&mut reader, n) {
                Ok(d) => d,
                Err(e) => {
                    t.fail();
                    return Err(e);
                }
            };
            self.channel
                .send(&Chunk::encode(command::DOWNLOAD_CHUNK, &data))?;
            progress.record(n)?;
        }
        t.advance(TransferState::Done)?;
        Ok(Served::acked(ack::download::OK, ack::download::OK, progress.bytes_transferred))
    }

    fn list(&mut self) -> ProtocolResult<Served> {
        let mut t = Transfer::new(OperationKind::List);
        t.advance(TransferState::SentRequest)?;

        let listing = match self.store.list() {
            Ok(names) => Some(names.join(",")),
            Err(e) => {
                self.ctx.logger.error("list", &e.to_string());
                None
            }
        };
        let listing = match listing {
            Some(l) if l.len() <= MAX_LIST_SIZE => l,
            _ => {
                t.advance(TransferState::Rejected)?;
                self.send_ack(Ack::new(ack::list::FAILED))?;
                return Ok(Served::acked(ack::list::FAILED, ack::list::OK, 0));
            }
        };

        t.advance(TransferState::Accepted)?;
        self.send_ack(Ack::with_size(ack::list::OK, listing.len() as u32))?;
        t.advance(TransferState::ReceivingChunks)?;
        self.channel
            .send(&Chunk::encode(command::LIST_DATA, listing.as_bytes()))?;
        t.advance(TransferState::Done)?;
        Ok(Served::acked(ack::list::OK, ack::list::OK, listing.len() as u64))
    }

    fn rename(&mut self, from: &str, to: &str) -> ProtocolResult<Served> {
        let mut t = Transfer::new(OperationKind::Rename);
        t.advance(TransferState::SentRequest)?;
        let code = if !self.store.exists(from)? {
            ack::modify::NOT_FOUND
        } else if self.store.exists(to)? {
            ack::modify::FAILED
        } else {
            match self.store.rename(from, to) {
                Ok(()) => ack::modify::OK,
                Err(e) => {
                    self.ctx.logger.error("rename", &e.to_string());
                    ack::modify::FAILED
                }
            }
        };
        self.finish_modify(t, code)
    }

    fn delete(&mut self, name: &str) -> ProtocolResult<Served> {
        let mut t = Transfer::new(OperationKind::Delete);
        t.advance(TransferState::SentRequest)?;
        let code = if !self.store.exists(name)? {
            ack::modify::NOT_FOUND
        } else {
            match self.store.remove(name) {
                Ok(()) => ack::modify::OK,
                Err(e) => {
                    self.ctx.logger.error("delete", &e.to_string());
                    ack::modify::FAILED
                }
            }
        };
        self.finish_modify(t, code)
    }

    fn finish_modify(&mut self, mut t: Transfer, code: u8) -> ProtocolResult<Served> {
        if code == ack::modify::OK {
            t.advance(TransferState::Accepted)?;
            t.advance(TransferState::Done)?;
        } else {
            t.advance(TransferState::Rejected)?;
        }
        self.send_ack(Ack::new(code))?;
        Ok(Served::acked(code, ack::modify::OK, 0))
    }
}
