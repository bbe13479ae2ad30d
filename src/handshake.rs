//! Mutual-authentication key exchange
//!
//! ```text
//! client                                   server
//!   username (size-prefixed)          ->
//!                                     <-   known? (size_t 0/1)
//!                                     <-   certificate PEM (size-prefixed)
//!   ephemeral key (size-prefixed)     ->
//!                                     <-   ServerLogin { key, len, E_k(sig_s(T)), iv }
//!   ClientLogin { E_k(sig_c(T)), iv } ->
//! ```
//!
//! `T` is always `server_ephemeral || client_ephemeral`. Both sides start
//! their send and receive counters at 0 once the exchange completes.

use p256::ecdsa::SigningKey;
use std::io::{Read, Write};

use crate::codec::{ClientLogin, ServerLogin, CLIENT_LOGIN_LEN, SERVER_LOGIN_LEN};
use crate::crypto::{decrypt_signature, encrypt_signature, sign, verify, EphemeralKeyPair};
use crate::envelope::SecureChannel;
use crate::error::{ProtocolError, ProtocolResult};
use crate::pki::{ServerIdentity, TrustStore};
use crate::protocol::{MAX_CERTIFICATE_SIZE, MAX_EPHEMERAL_KEY_SIZE, MAX_USERNAME_LEN};
use crate::protocol_core::{read_exact_vec, read_size, read_sized, write_all, write_size, write_sized};
use crate::registry::IdentityRegistry;

const USER_UNKNOWN: u64 = 0;
const USER_KNOWN: u64 = 1;

fn transcript(server_key: &[u8], client_key: &[u8]) -> Vec<u8> {
    let mut t = Vec::with_capacity(server_key.len() + client_key.len());
    t.extend_from_slice(server_key);
    t.extend_from_slice(client_key);
    t
}

pub fn validate_username(username: &str) -> ProtocolResult<()> {
    if username.is_empty() {
        return Err(ProtocolError::InvalidInput("empty username".into()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(ProtocolError::InvalidInput(format!(
            "username is {} bytes (max {})",
            username.len(),
            MAX_USERNAME_LEN
        )));
    }
    Ok(())
}

/// Run the client side. `unlock` is called once the server has confirmed
/// the username, and the unlocked key is handed back so a later
/// re-handshake does not need the passphrase again.
pub fn client_handshake<S, F>(
    mut stream: S,
    username: &str,
    unlock: F,
    trust: &TrustStore,
    counter_limit: u32,
) -> ProtocolResult<(SecureChannel<S>, SigningKey)>
where
    S: Read + Write,
    F: FnOnce() -> ProtocolResult<SigningKey>,
{
    validate_username(username)?;
    write_sized(&mut stream, username.as_bytes())?;
    if read_size(&mut stream)? == USER_UNKNOWN {
        return Err(ProtocolError::UnknownIdentity(username.to_string()));
    }

    let signing_key = unlock()?;

    let cert_pem = read_sized(&mut stream, "certificate", MAX_CERTIFICATE_SIZE)?;
    let server_key = trust.verify_server_certificate(&cert_pem)?;

    let ephemeral = EphemeralKeyPair::generate();
    let client_pub = ephemeral.public_bytes().to_vec();
    write_sized(&mut stream, &client_pub)?;

    let login = ServerLogin::decode(&read_exact_vec(&mut stream, SERVER_LOGIN_LEN)?)?;
    let session_key = ephemeral.agree(&login.ephemeral_key)?;
    let t = transcript(&login.ephemeral_key, &client_pub);

    let server_sig = decrypt_signature(&session_key, &login.encrypted_signature, &login.iv)?;
    verify(&server_key, &t, &server_sig)?;

    let (encrypted_signature, iv) = encrypt_signature(&session_key, &sign(&signing_key, &t))?;
    write_all(
        &mut stream,
        &ClientLogin {
            encrypted_signature,
            iv,
        }
        .encode(),
    )?;

    Ok((
        SecureChannel::with_limit(stream, session_key, counter_limit),
        signing_key,
    ))
}

/// Run the server side; returns the authenticated username.
pub fn server_handshake<S>(
    mut stream: S,
    identity: &ServerIdentity,
    registry: &IdentityRegistry,
    counter_limit: u32,
) -> ProtocolResult<(String, SecureChannel<S>)>
where
    S: Read + Write,
{
    let raw_name = read_sized(&mut stream, "username", MAX_USERNAME_LEN)?;
    let client_key = match String::from_utf8(raw_name) {
        Ok(name) => registry.lookup(&name).map(|k| (name, *k)),
        Err(_) => None,
    };
    let (username, client_key) = match client_key {
        Some(found) => {
            write_size(&mut stream, USER_KNOWN)?;
            found
        }
        None => {
            write_size(&mut stream, USER_UNKNOWN)?;
            return Err(ProtocolError::UnknownIdentity(
                "username not in roster".to_string(),
            ));
        }
    };

    if identity.certificate_pem.len() > MAX_CERTIFICATE_SIZE {
        return Err(ProtocolError::OversizedMessage {
            what: "certificate",
            len: identity.certificate_pem.len() as u64,
            max: MAX_CERTIFICATE_SIZE as u64,
        });
    }
    write_sized(&mut stream, &identity.certificate_pem)?;

    let client_pub = read_sized(&mut stream, "ephemeral key", MAX_EPHEMERAL_KEY_SIZE)?;
    let ephemeral = EphemeralKeyPair::generate();
    let server_pub = ephemeral.public_bytes().to_vec();
    let session_key = ephemeral.agree(&client_pub)?;
    let t = transcript(&server_pub, &client_pub);

    let (encrypted_signature, iv) =
        encrypt_signature(&session_key, &sign(&identity.signing_key, &t))?;
    let login = ServerLogin {
        ephemeral_key: server_pub,
        encrypted_signature,
        iv,
    };
    write_all(&mut stream, &login.encode()?)?;

    let reply = ClientLogin::decode(&read_exact_vec(&mut stream, CLIENT_LOGIN_LEN)?)?;
    let client_sig = decrypt_signature(&session_key, &reply.encrypted_signature, &reply.iv)?;
    verify(&client_key, &t, &client_sig)?;

    Ok((
        username,
        SecureChannel::with_limit(stream, session_key, counter_limit),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{
        load_encrypted_signing_key, provision, server_cert_path, server_key_path,
        user_private_key_path, users_dir, ProvisionOptions, ProvisionUser,
    };
    use crate::protocol::COUNTER_LIMIT;
    use std::net::{TcpListener, TcpStream};
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;

    fn setup(opts: &ProvisionOptions) -> TempDir {
        let tmp = TempDir::new().unwrap();
        let users = vec![ProvisionUser {
            name: "alice".into(),
            passphrase: "pw".into(),
        }];
        provision(tmp.path(), &users, opts).unwrap();
        tmp
    }

    fn spawn_server(
        dir: &Path,
    ) -> (
        u16,
        thread::JoinHandle<ProtocolResult<(String, SecureChannel<TcpStream>)>>,
    ) {
        let identity =
            ServerIdentity::load(&server_cert_path(dir), &server_key_path(dir)).unwrap();
        let registry = IdentityRegistry::load_dir(&users_dir(dir)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let h = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            server_handshake(sock, &identity, &registry, COUNTER_LIMIT)
        });
        (port, h)
    }

    #[test]
    fn test_handshake_agrees_on_key() {
        let tmp = setup(&ProvisionOptions::default());
        let (port, server) = spawn_server(tmp.path());
        let trust = TrustStore::from_dir(tmp.path()).unwrap();
        let key_path = user_private_key_path(&users_dir(tmp.path()), "alice");

        let sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (mut client, _) = client_handshake(
            sock,
            "alice",
            || load_encrypted_signing_key(&key_path, "pw"),
            &trust,
            COUNTER_LIMIT,
        )
        .unwrap();

        let (user, mut srv) = server.join().unwrap().unwrap();
        assert_eq!(user, "alice");

        // a frame sealed by one side opens on the other
        client.send(b"ping").unwrap();
        assert_eq!(srv.recv(4).unwrap(), b"ping");
        srv.send(b"pong").unwrap();
        assert_eq!(client.recv(4).unwrap(), b"pong");
    }

    #[test]
    fn test_unknown_user_rejected() {
        let tmp = setup(&ProvisionOptions::default());
        let (port, server) = spawn_server(tmp.path());
        let trust = TrustStore::from_dir(tmp.path()).unwrap();

        let sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let res = client_handshake(
            sock,
            "mallory",
            || panic!("key must not be unlocked for an unknown user"),
            &trust,
            COUNTER_LIMIT,
        );
        assert!(matches!(res, Err(ProtocolError::UnknownIdentity(_))));
        assert!(matches!(
            server.join().unwrap(),
            Err(ProtocolError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn test_wrong_client_key_fails_server_verification() {
        let tmp = setup(&ProvisionOptions::default());
        let (port, server) = spawn_server(tmp.path());
        let trust = TrustStore::from_dir(tmp.path()).unwrap();

        let sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // a valid key that is not alice's registered key
        let imposter = SigningKey::random(&mut rand::rngs::OsRng);
        let _ = client_handshake(sock, "alice", || Ok(imposter), &trust, COUNTER_LIMIT);
        assert!(matches!(
            server.join().unwrap(),
            Err(ProtocolError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_revoked_server_certificate() {
        let tmp = setup(&ProvisionOptions {
            revoke_server: true,
            ..Default::default()
        });
        let (port, server) = spawn_server(tmp.path());
        let trust = TrustStore::from_dir(tmp.path()).unwrap();
        let key_path = user_private_key_path(&users_dir(tmp.path()), "alice");

        let sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let res = client_handshake(
            sock,
            "alice",
            || load_encrypted_signing_key(&key_path, "pw"),
            &trust,
            COUNTER_LIMIT,
        );
        assert!(matches!(res, Err(ProtocolError::UntrustedCertificate(_))));
        // client hung up after the certificate
        assert!(server.join().unwrap().is_err());
    }

    #[test]
    fn test_oversized_username_rejected_by_server() {
        let tmp = setup(&ProvisionOptions::default());
        let (port, server) = spawn_server(tmp.path());

        let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write_size(&mut sock, 1 << 20).unwrap();
        assert!(matches!(
            server.join().unwrap(),
            Err(ProtocolError::OversizedMessage { what: "username", .. })
        ));
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username(&"a".repeat(MAX_USERNAME_LEN + 1)).is_err());
    }
}
