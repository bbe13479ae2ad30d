use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

use crate::codec::OperationKind;

pub trait Logger: Send + Sync {
    fn listening(&self, _bind: &str, _data_root: &Path, _users: usize) {}
    fn connected(&self, _peer: SocketAddr) {}
    fn authenticated(&self, _peer: SocketAddr, _username: &str) {}
    fn handshake_failed(&self, _peer: SocketAddr, _msg: &str) {}
    fn operation(&self, _username: &str, _kind: OperationKind, _name: &str, _result: &str, _bytes: u64) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn disconnected(&self, _peer: SocketAddr, _username: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(Box::new(f)),
        })
    }

    pub fn stderr() -> Self {
        Self {
            out: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    fn line(&self, s: &str) {
        let mut out = self.out.lock();
        let _ = writeln!(out, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn listening(&self, bind: &str, data_root: &Path, users: usize) {
        self.line(&format!(
            "LISTEN bind={} root={} users={}",
            bind,
            data_root.display(),
            users
        ));
    }
    fn connected(&self, peer: SocketAddr) {
        self.line(&format!("CONNECT peer={peer}"));
    }
    fn authenticated(&self, peer: SocketAddr, username: &str) {
        self.line(&format!("AUTH peer={peer} user={username}"));
    }
    fn handshake_failed(&self, peer: SocketAddr, msg: &str) {
        self.line(&format!("AUTH_FAIL peer={peer} msg={msg}"));
    }
    fn operation(&self, username: &str, kind: OperationKind, name: &str, result: &str, bytes: u64) {
        self.line(&format!(
            "OP user={username} op={kind} file={name} result={result} bytes={bytes}"
        ));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn disconnected(&self, peer: SocketAddr, username: &str) {
        self.line(&format!("DISCONNECT peer={peer} user={username}"));
    }
}
