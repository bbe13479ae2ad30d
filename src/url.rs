//! URL parsing for cloudvault:// server addresses

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServer {
    pub username: Option<String>,
    pub host: String,
    pub port: u16,
}

impl RemoteServer {
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse `cloudvault://[user@]host[:port]`. A bare `host[:port]` is
/// accepted too.
pub fn parse_server_url(s: &str) -> Option<RemoteServer> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let rest = if lower.starts_with("cloudvault://") {
        &s_trim["cloudvault://".len()..]
    } else if lower.contains("://") {
        return None;
    } else {
        s_trim
    };
    let rest = rest.trim_end_matches('/');
    let (username, hp) = match rest.rsplit_once('@') {
        Some((u, hp)) if !u.is_empty() => (Some(u.to_string()), hp),
        Some(_) => return None,
        None => (None, rest),
    };
    if hp.is_empty() {
        return None;
    }
    // [v6]:port
    if let Some(inner) = hp.strip_prefix('[') {
        let (host, tail) = inner.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return None,
        };
        return Some(RemoteServer {
            username,
            host: host.to_string(),
            port,
        });
    }
    let (host, port) = match hp.split_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteServer {
        username,
        host,
        port,
    })
}
