//! Counter-bound AEAD framing for everything after the handshake
//!
//! Wire form of one frame: `counter u32 BE | iv(12) | ciphertext | tag(16)`.
//! The counter and IV are bound as associated data, so a replayed,
//! reordered or dropped frame fails either the tag or the counter check.

use std::io::{Read, Write};

use crate::crypto::{aead_decrypt, aead_encrypt, random_array, SessionKey};
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{COUNTER_LEN, COUNTER_LIMIT, GCM_IV_LEN, GCM_TAG_LEN};
use crate::protocol_core::{read_exact_vec, write_all};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub counter: u32,
    pub iv: [u8; GCM_IV_LEN],
    /// AEAD output including the trailing tag
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Bytes on the wire for a plaintext of `payload_len`.
    pub const fn wire_len(payload_len: usize) -> usize {
        COUNTER_LEN + GCM_IV_LEN + payload_len + GCM_TAG_LEN
    }

    fn aad(counter: u32, iv: &[u8; GCM_IV_LEN]) -> [u8; COUNTER_LEN + GCM_IV_LEN] {
        let mut aad = [0u8; COUNTER_LEN + GCM_IV_LEN];
        aad[..COUNTER_LEN].copy_from_slice(&counter.to_be_bytes());
        aad[COUNTER_LEN..].copy_from_slice(iv);
        aad
    }

    pub fn seal(key: &SessionKey, counter: u32, plaintext: &[u8]) -> ProtocolResult<Self> {
        let iv: [u8; GCM_IV_LEN] = random_array();
        let ciphertext = aead_encrypt(key, &iv, &Self::aad(counter, &iv), plaintext)?;
        Ok(Self {
            counter,
            iv,
            ciphertext,
        })
    }

    /// Tag first, then counter: a forged frame never reports a counter value.
    pub fn open(&self, key: &SessionKey, expected_counter: u32) -> ProtocolResult<Vec<u8>> {
        let plaintext = aead_decrypt(
            key,
            &self.iv,
            &Self::aad(self.counter, &self.iv),
            &self.ciphertext,
        )?;
        if self.counter != expected_counter {
            return Err(ProtocolError::CounterMismatch {
                expected: expected_counter,
                actual: self.counter,
            });
        }
        Ok(plaintext)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COUNTER_LEN + GCM_IV_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.counter.to_be_bytes());
        buf.extend_from_slice(&self.iv);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    /// Parse a frame whose plaintext is known to be `payload_len` bytes.
    pub fn from_bytes(buf: &[u8], payload_len: usize) -> ProtocolResult<Self> {
        if buf.len() != Self::wire_len(payload_len) {
            return Err(ProtocolError::malformed(format!(
                "envelope is {} bytes, expected {}",
                buf.len(),
                Self::wire_len(payload_len)
            )));
        }
        let counter = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut iv = [0u8; GCM_IV_LEN];
        iv.copy_from_slice(&buf[COUNTER_LEN..COUNTER_LEN + GCM_IV_LEN]);
        Ok(Self {
            counter,
            iv,
            ciphertext: buf[COUNTER_LEN + GCM_IV_LEN..].to_vec(),
        })
    }
}

/// Monotonic per-direction frame counter.
#[derive(Debug, Clone, Copy)]
pub struct DirectionalCounter {
    next: u32,
    limit: u32,
}

impl DirectionalCounter {
    pub fn new(limit: u32) -> Self {
        Self { next: 0, limit }
    }

    pub fn current(&self) -> u32 {
        self.next
    }

    /// Frames still available in this direction.
    pub fn remaining(&self) -> u64 {
        (self.limit as u64).saturating_sub(self.next as u64)
    }

    /// Claim the current value; fails once the limit is reached.
    pub fn advance(&mut self) -> ProtocolResult<u32> {
        if self.next >= self.limit {
            return Err(ProtocolError::CounterExhausted);
        }
        let v = self.next;
        self.next += 1;
        Ok(v)
    }
}

impl Default for DirectionalCounter {
    fn default() -> Self {
        Self::new(COUNTER_LIMIT)
    }
}

/// Established session transport: one key, a send counter and a receive
/// counter. Both ends start both counters at 0.
pub struct SecureChannel<S> {
    stream: S,
    key: SessionKey,
    send: DirectionalCounter,
    recv: DirectionalCounter,
}

impl<S: Read + Write> SecureChannel<S> {
    pub fn new(stream: S, key: SessionKey) -> Self {
        Self::with_limit(stream, key, COUNTER_LIMIT)
    }

    pub fn with_limit(stream: S, key: SessionKey, limit: u32) -> Self {
        Self {
            stream,
            key,
            send: DirectionalCounter::new(limit),
            recv: DirectionalCounter::new(limit),
        }
    }

    pub fn send(&mut self, plaintext: &[u8]) -> ProtocolResult<()> {
        let counter = self.send.advance()?;
        let env = Envelope::seal(&self.key, counter, plaintext)?;
        write_all(&mut self.stream, &env.to_bytes())
    }

    /// Receive one frame whose plaintext length the caller already knows.
    pub fn recv(&mut self, payload_len: usize) -> ProtocolResult<Vec<u8>> {
        let expected = self.recv.current();
        if self.recv.remaining() == 0 {
            return Err(ProtocolError::CounterExhausted);
        }
        let raw = read_exact_vec(&mut self.stream, Envelope::wire_len(payload_len))?;
        let env = Envelope::from_bytes(&raw, payload_len)?;
        let plaintext = env.open(&self.key, expected)?;
        self.recv.advance()?;
        Ok(plaintext)
    }

    pub fn send_remaining(&self) -> u64 {
        self.send.remaining()
    }

    pub fn recv_remaining(&self) -> u64 {
        self.recv.remaining()
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
