//! Identity material: trust anchors, long-term keys and demo provisioning
//!
//! Layout produced by [`provision`] and expected by the daemon and client:
//!
//! ```text
//! <dir>/ca.pem                      trusted CA certificate
//! <dir>/crl.pem                     CA-signed revocation list
//! <dir>/server-cert.pem             server certificate (CA-signed)
//! <dir>/server-key.pem              server PKCS#8 private key
//! <dir>/users/<name>/public.pem     client public key (server roster)
//! <dir>/users/<name>/private.pem    client encrypted PKCS#8 private key
//! ```

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use x509_parser::prelude::*;

use crate::error::{ProtocolError, ProtocolResult};

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("CloudVault");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("cloudvault");
    }
    PathBuf::from(".cloudvault")
}

pub fn ca_path(dir: &Path) -> PathBuf {
    dir.join("ca.pem")
}

pub fn crl_path(dir: &Path) -> PathBuf {
    dir.join("crl.pem")
}

pub fn server_cert_path(dir: &Path) -> PathBuf {
    dir.join("server-cert.pem")
}

pub fn server_key_path(dir: &Path) -> PathBuf {
    dir.join("server-key.pem")
}

pub fn users_dir(dir: &Path) -> PathBuf {
    dir.join("users")
}

pub fn user_public_key_path(users_dir: &Path, username: &str) -> PathBuf {
    users_dir.join(username).join("public.pem")
}

pub fn user_private_key_path(users_dir: &Path, username: &str) -> PathBuf {
    users_dir.join(username).join("private.pem")
}

pub fn fp_sha256_hex(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

fn read_first_cert(path: &Path) -> Result<Vec<u8>> {
    let mut rd = BufReader::new(fs::File::open(path).with_context(|| format!("open {}", path.display()))?);
    let cert = rustls_pemfile::certs(&mut rd)
        .next()
        .with_context(|| format!("no certificate in {}", path.display()))?
        .with_context(|| format!("read certificate {}", path.display()))?;
    Ok(cert.to_vec())
}

fn read_first_crl(path: &Path) -> Result<Vec<u8>> {
    let mut rd = BufReader::new(fs::File::open(path).with_context(|| format!("open {}", path.display()))?);
    let crl = rustls_pemfile::crls(&mut rd)
        .next()
        .with_context(|| format!("no CRL in {}", path.display()))?
        .with_context(|| format!("read CRL {}", path.display()))?;
    Ok(crl.to_vec())
}

/// Client-side trust anchors: one CA certificate and its revocation list.
#[derive(Debug, Clone)]
pub struct TrustStore {
    ca_der: Vec<u8>,
    crl_der: Vec<u8>,
}

impl TrustStore {
    pub fn load(ca: &Path, crl: &Path) -> Result<Self> {
        let ca_der = read_first_cert(ca)?;
        let crl_der = read_first_crl(crl)?;
        // fail at load time rather than on the first handshake
        parse_x509_certificate(&ca_der).map_err(|e| anyhow::anyhow!("parse CA certificate: {e}"))?;
        parse_x509_crl(&crl_der).map_err(|e| anyhow::anyhow!("parse CRL: {e}"))?;
        Ok(Self { ca_der, crl_der })
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        Self::load(&ca_path(dir), &crl_path(dir))
    }

    pub fn ca_fingerprint(&self) -> String {
        fp_sha256_hex(&self.ca_der)
    }

    /// Validate a PEM server certificate against the CA and CRL and return
    /// its public key. Every failure is `UntrustedCertificate`.
    pub fn verify_server_certificate(&self, pem: &[u8]) -> ProtocolResult<VerifyingKey> {
        let untrusted = |msg: &str| ProtocolError::UntrustedCertificate(msg.to_string());

        let mut rd = pem;
        let der = rustls_pemfile::certs(&mut rd)
            .next()
            .ok_or_else(|| untrusted("no certificate in PEM data"))?
            .map_err(|_| untrusted("unreadable PEM certificate"))?;

        let (_, cert) = parse_x509_certificate(&der).map_err(|_| untrusted("unparseable certificate"))?;
        let (_, ca) = parse_x509_certificate(&self.ca_der).map_err(|_| untrusted("unparseable CA certificate"))?;
        let (_, crl) = parse_x509_crl(&self.crl_der).map_err(|_| untrusted("unparseable CRL"))?;

        if cert.issuer() != ca.subject() {
            return Err(untrusted("certificate not issued by trusted CA"));
        }
        cert.verify_signature(Some(ca.public_key()))
            .map_err(|_| untrusted("certificate signature does not chain to CA"))?;
        if !cert.validity().is_valid() {
            return Err(untrusted("certificate expired or not yet valid"));
        }

        if crl.issuer() != ca.subject() {
            return Err(untrusted("CRL not issued by trusted CA"));
        }
        crl.verify_signature(ca.public_key())
            .map_err(|_| untrusted("CRL signature does not verify"))?;
        if let Some(next) = crl.next_update() {
            if next < ASN1Time::now() {
                return Err(untrusted("CRL is stale"));
            }
        }
        if crl
            .iter_revoked_certificates()
            .any(|r| r.user_certificate == cert.serial)
        {
            return Err(untrusted("certificate revoked"));
        }

        VerifyingKey::from_public_key_der(cert.public_key().raw)
            .map_err(|_| untrusted("certificate key is not ECDSA P-256"))
    }
}

/// Server long-term identity: the certificate it presents and the key
/// that signs handshake transcripts.
pub struct ServerIdentity {
    pub certificate_pem: Vec<u8>,
    pub signing_key: SigningKey,
}

impl ServerIdentity {
    pub fn load(cert: &Path, key: &Path) -> Result<Self> {
        let certificate_pem = fs::read(cert).with_context(|| format!("read {}", cert.display()))?;
        let key_pem = fs::read_to_string(key).with_context(|| format!("read {}", key.display()))?;
        let signing_key = SigningKey::from_pkcs8_pem(&key_pem)
            .map_err(|e| anyhow::anyhow!("parse server key {}: {e}", key.display()))?;
        Ok(Self {
            certificate_pem,
            signing_key,
        })
    }
}

/// Unlock a passphrase-protected PKCS#8 key.
pub fn load_encrypted_signing_key(path: &Path, passphrase: &str) -> ProtocolResult<SigningKey> {
    let pem = fs::read_to_string(path).map_err(|e| ProtocolError::filesystem(path, e))?;
    SigningKey::from_pkcs8_encrypted_pem(&pem, passphrase.as_bytes()).map_err(|_| {
        ProtocolError::InvalidCredential(format!("cannot unlock {}", path.display()))
    })
}

pub fn load_public_key(path: &Path) -> ProtocolResult<VerifyingKey> {
    let pem = fs::read_to_string(path).map_err(|e| ProtocolError::filesystem(path, e))?;
    VerifyingKey::from_public_key_pem(&pem)
        .map_err(|_| ProtocolError::malformed(format!("bad public key in {}", path.display())))
}

fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).with_context(|| format!("create {}", p.display()))?;
    }
    let temp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&temp_path).context("create temp file")?;
        #[cfg(unix)]
        if private {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata()?.permissions();
            perms.set_mode(0o600);
            f.set_permissions(perms)?;
        }
        #[cfg(not(unix))]
        let _ = private;
        f.write_all(contents)?;
        f.flush()?;
        f.sync_all()?;
    }
    fs::rename(&temp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ProvisionUser {
    pub name: String,
    pub passphrase: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    /// Server host names placed in the certificate SAN list
    pub server_names: Vec<String>,
    /// List the server certificate in the CRL (exercise the revocation path)
    pub revoke_server: bool,
}

const CA_SERIAL: u64 = 1;
const SERVER_SERIAL: u64 = 2;

/// Generate a demo CA, a CA-signed server certificate, a CRL and one key
/// pair per user under `dir`.
pub fn provision(dir: &Path, users: &[ProvisionUser], opts: &ProvisionOptions) -> Result<()> {
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, CertificateRevocationList,
        CertificateRevocationListParams, DnType, IsCa, KeyIdMethod, KeyUsagePurpose,
        RevokedCertParams, SerialNumber, PKCS_ECDSA_P256_SHA256,
    };

    for u in users {
        if u.name.is_empty() || u.name.len() > crate::protocol::MAX_USERNAME_LEN {
            bail!("username {:?} must be 1..={} bytes", u.name, crate::protocol::MAX_USERNAME_LEN);
        }
        crate::protocol_core::validate_file_name(&u.name)
            .with_context(|| format!("username {:?} is not usable as a directory name", u.name))?;
    }

    let mut ca_params = CertificateParams::new(Vec::<String>::new());
    ca_params.distinguished_name.push(DnType::CommonName, "CloudVault CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    ca_params.serial_number = Some(SerialNumber::from(CA_SERIAL));
    let ca = Certificate::from_params(ca_params).context("generate CA")?;

    let names = if opts.server_names.is_empty() {
        vec!["cloudvault.local".to_string(), "localhost".to_string()]
    } else {
        opts.server_names.clone()
    };
    let mut srv_params = CertificateParams::new(names);
    srv_params.distinguished_name.push(DnType::CommonName, "cloudvaultd");
    srv_params.serial_number = Some(SerialNumber::from(SERVER_SERIAL));
    let server = Certificate::from_params(srv_params).context("generate server certificate")?;

    let now = Utc::now();
    let (y, m, d) = (now.year(), now.month() as u8, (now.day() as u8).min(28));
    let mut revoked_certs = Vec::new();
    if opts.revoke_server {
        revoked_certs.push(RevokedCertParams {
            serial_number: SerialNumber::from(SERVER_SERIAL),
            revocation_time: rcgen::date_time_ymd(y, m, d),
            reason_code: None,
            invalidity_date: None,
        });
    }
    let crl = CertificateRevocationList::from_params(CertificateRevocationListParams {
        this_update: rcgen::date_time_ymd(y - 1, m, d),
        next_update: rcgen::date_time_ymd(y + 1, m, d),
        crl_number: SerialNumber::from(1u64),
        issuing_distribution_point: None,
        revoked_certs,
        alg: &PKCS_ECDSA_P256_SHA256,
        key_identifier_method: KeyIdMethod::Sha256,
    })
    .context("build CRL")?;

    write_atomic(&ca_path(dir), ca.serialize_pem().context("serialize CA")?.as_bytes(), false)?;
    write_atomic(
        &crl_path(dir),
        crl.serialize_pem_with_signer(&ca).context("sign CRL")?.as_bytes(),
        false,
    )?;
    write_atomic(
        &server_cert_path(dir),
        server
            .serialize_pem_with_signer(&ca)
            .context("sign server certificate")?
            .as_bytes(),
        false,
    )?;
    write_atomic(&server_key_path(dir), server.serialize_private_key_pem().as_bytes(), true)?;

    let udir = users_dir(dir);
    for u in users {
        let key = SigningKey::random(&mut OsRng);
        let public = VerifyingKey::from(&key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("encode public key for {}: {e}", u.name))?;
        let private = key
            .to_pkcs8_encrypted_pem(&mut OsRng, u.passphrase.as_bytes(), LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("encrypt private key for {}: {e}", u.name))?;
        write_atomic(&user_public_key_path(&udir, &u.name), public.as_bytes(), false)?;
        write_atomic(&user_private_key_path(&udir, &u.name), private.as_bytes(), true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::{Signer, Verifier};
    use p256::ecdsa::Signature;
    use tempfile::TempDir;

    fn alice() -> Vec<ProvisionUser> {
        vec![ProvisionUser {
            name: "alice".into(),
            passphrase: "correct horse".into(),
        }]
    }

    #[test]
    fn test_provisioned_server_cert_is_trusted() {
        let tmp = TempDir::new().unwrap();
        provision(tmp.path(), &alice(), &ProvisionOptions::default()).unwrap();

        let trust = TrustStore::from_dir(tmp.path()).unwrap();
        let identity =
            ServerIdentity::load(&server_cert_path(tmp.path()), &server_key_path(tmp.path())).unwrap();
        let cert_key = trust.verify_server_certificate(&identity.certificate_pem).unwrap();

        // the certificate key matches the server signing key
        let sig: Signature = identity.signing_key.sign(b"msg");
        cert_key.verify(b"msg", &sig).unwrap();
    }

    #[test]
    fn test_revoked_server_cert_is_untrusted() {
        let tmp = TempDir::new().unwrap();
        let opts = ProvisionOptions {
            revoke_server: true,
            ..Default::default()
        };
        provision(tmp.path(), &alice(), &opts).unwrap();
        let trust = TrustStore::from_dir(tmp.path()).unwrap();
        let pem = fs::read(server_cert_path(tmp.path())).unwrap();
        match trust.verify_server_certificate(&pem) {
            Err(ProtocolError::UntrustedCertificate(msg)) => assert!(msg.contains("revoked")),
            other => panic!("expected revocation failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_cert_from_foreign_ca_is_untrusted() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        provision(a.path(), &alice(), &ProvisionOptions::default()).unwrap();
        provision(b.path(), &alice(), &ProvisionOptions::default()).unwrap();

        let trust_a = TrustStore::from_dir(a.path()).unwrap();
        let pem_b = fs::read(server_cert_path(b.path())).unwrap();
        assert!(matches!(
            trust_a.verify_server_certificate(&pem_b),
            Err(ProtocolError::UntrustedCertificate(_))
        ));
        assert!(matches!(
            trust_a.verify_server_certificate(b"not a pem"),
            Err(ProtocolError::UntrustedCertificate(_))
        ));
    }

    #[test]
    fn test_client_key_unlock() {
        let tmp = TempDir::new().unwrap();
        provision(tmp.path(), &alice(), &ProvisionOptions::default()).unwrap();
        let udir = users_dir(tmp.path());

        let key =
            load_encrypted_signing_key(&user_private_key_path(&udir, "alice"), "correct horse").unwrap();
        let public = load_public_key(&user_public_key_path(&udir, "alice")).unwrap();
        assert_eq!(VerifyingKey::from(&key), public);

        assert!(matches!(
            load_encrypted_signing_key(&user_private_key_path(&udir, "alice"), "wrong"),
            Err(ProtocolError::InvalidCredential(_))
        ));
        assert!(matches!(
            load_encrypted_signing_key(&user_private_key_path(&udir, "bob"), "x"),
            Err(ProtocolError::FilesystemFailure { .. })
        ));
    }

    #[test]
    fn test_provision_rejects_bad_usernames() {
        let tmp = TempDir::new().unwrap();
        let users = vec![ProvisionUser {
            name: "../evil".into(),
            passphrase: "p".into(),
        }];
        assert!(provision(tmp.path(), &users, &ProvisionOptions::default()).is_err());
        let users = vec![ProvisionUser {
            name: "x".repeat(31),
            passphrase: "p".into(),
        }];
        assert!(provision(tmp.path(), &users, &ProvisionOptions::default()).is_err());
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fp_sha256_hex(b"abc");
        assert_eq!(fp.len(), 64);
        assert!(fp.starts_with("ba7816bf"));
    }
}
