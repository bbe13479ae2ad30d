//! Cryptographic primitives used by the handshake and the envelope
//!
//! ECDH over P-256 for key agreement, ECDSA P-256/SHA-256 for transcript
//! signatures, AES-128-CBC to hide those signatures on the wire and
//! AES-128-GCM for every post-handshake frame.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{CBC_IV_LEN, ENCRYPTED_SIGNATURE_SIZE, GCM_IV_LEN, SESSION_KEY_LEN, SIGNATURE_LEN};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Symmetric key shared by both ends after a successful handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// First 16 bytes of SHA-256 over the raw ECDH shared secret.
    pub fn derive(shared_secret: &[u8]) -> Self {
        let digest = Sha256::digest(shared_secret);
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&digest[..SESSION_KEY_LEN]);
        SessionKey(key)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// One-shot ECDH key pair; the secret is consumed by `agree`.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: Vec<u8>,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self { secret, public }
    }

    /// SEC1 uncompressed encoding of the public half.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    pub fn agree(self, peer_public: &[u8]) -> ProtocolResult<SessionKey> {
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|_| ProtocolError::malformed("peer ephemeral key is not a valid P-256 point"))?;
        let shared = self.secret.diffie_hellman(&peer);
        Ok(SessionKey::derive(shared.raw_secret_bytes().as_slice()))
    }
}

pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_LEN] {
    let sig: Signature = key.sign(message);
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(sig.to_bytes().as_slice());
    out
}

pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> ProtocolResult<()> {
    let sig = Signature::from_slice(signature)
        .map_err(|_| ProtocolError::AuthenticationFailed("transcript signature"))?;
    key.verify(message, &sig)
        .map_err(|_| ProtocolError::AuthenticationFailed("transcript signature"))
}

/// Encrypt a transcript signature under the session key with a fresh IV.
pub fn encrypt_signature(
    key: &SessionKey,
    signature: &[u8; SIGNATURE_LEN],
) -> ProtocolResult<([u8; ENCRYPTED_SIGNATURE_SIZE], [u8; CBC_IV_LEN])> {
    let iv: [u8; CBC_IV_LEN] = random_array();
    let enc = Aes128CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|_| ProtocolError::malformed("bad CBC key or IV length"))?;
    let ct = enc.encrypt_padded_vec_mut::<Pkcs7>(signature);
    let mut out = [0u8; ENCRYPTED_SIGNATURE_SIZE];
    if ct.len() != ENCRYPTED_SIGNATURE_SIZE {
        return Err(ProtocolError::malformed(format!(
            "encrypted signature is {} bytes, expected {}",
            ct.len(),
            ENCRYPTED_SIGNATURE_SIZE
        )));
    }
    out.copy_from_slice(&ct);
    Ok((out, iv))
}

/// Any padding or length problem is reported as an authentication failure
/// so a tampered signature is indistinguishable from a wrong one.
pub fn decrypt_signature(
    key: &SessionKey,
    ciphertext: &[u8; ENCRYPTED_SIGNATURE_SIZE],
    iv: &[u8; CBC_IV_LEN],
) -> ProtocolResult<Vec<u8>> {
    let dec = Aes128CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| ProtocolError::malformed("bad CBC key or IV length"))?;
    let pt = dec
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ProtocolError::AuthenticationFailed("transcript signature"))?;
    if pt.len() != SIGNATURE_LEN {
        return Err(ProtocolError::AuthenticationFailed("transcript signature"));
    }
    Ok(pt)
}

pub fn aead_encrypt(
    key: &SessionKey,
    iv: &[u8; GCM_IV_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> ProtocolResult<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| ProtocolError::malformed("bad AEAD key length"))?;
    cipher
        .encrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| ProtocolError::malformed("AEAD encryption failed"))
}

pub fn aead_decrypt(
    key: &SessionKey,
    iv: &[u8; GCM_IV_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> ProtocolResult<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| ProtocolError::malformed("bad AEAD key length"))?;
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| ProtocolError::AuthenticationFailed("envelope tag"))
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}
