use anyhow::Result;
use std::io::Write;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use cloudvault::client::{default_key_path, ClientOptions};
use cloudvault::codec::OperationKind;
use cloudvault::log::{TransferLog, TransferStatus};
use cloudvault::logger::NoopLogger;
use cloudvault::pki::{
    load_encrypted_signing_key, provision, server_cert_path, server_key_path, users_dir,
    ProvisionOptions, ProvisionUser, ServerIdentity, TrustStore,
};
use cloudvault::registry::IdentityRegistry;
use cloudvault::server::{serve_listener, ServerContext};
use cloudvault::transfer::NoopProgress;
use cloudvault::{Client, Operation, OperationOutcome, ProtocolError};

struct Fixture {
    pki: tempfile::TempDir,
    data: tempfile::TempDir,
    addr: String,
}

impl Fixture {
    fn start(opts: ProvisionOptions) -> Result<Self> {
        let pki = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let users = vec![
            ProvisionUser {
                name: "alice".into(),
                passphrase: "alice-pw".into(),
            },
            ProvisionUser {
                name: "bob".into(),
                passphrase: "bob-pw".into(),
            },
        ];
        provision(pki.path(), &users, &opts)?;

        let identity = ServerIdentity::load(
            &server_cert_path(pki.path()),
            &server_key_path(pki.path()),
        )?;
        let registry = IdentityRegistry::load_dir(&users_dir(pki.path()))?;
        let mut ctx = ServerContext::new(
            identity,
            registry,
            data.path().to_path_buf(),
            Arc::new(NoopLogger),
        );
        ctx.journal = Some(TransferLog::new(data.path()));

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();
        let ctx = Arc::new(ctx);
        thread::spawn(move || {
            let _ = serve_listener(listener, ctx);
        });
        Ok(Self { pki, data, addr })
    }

    fn key_path(&self, user: &str) -> PathBuf {
        default_key_path(&users_dir(self.pki.path()), user)
    }

    fn connect_with(
        &self,
        user: &str,
        pass: &str,
        opts: ClientOptions,
    ) -> cloudvault::ProtocolResult<Client> {
        let trust = TrustStore::from_dir(self.pki.path()).expect("trust store");
        let key = self.key_path(user);
        Client::connect(
            &self.addr,
            user,
            trust,
            || load_encrypted_signing_key(&key, pass),
            opts,
        )
    }

    fn connect(&self, user: &str, pass: &str) -> Client {
        self.connect_with(user, pass, ClientOptions::default())
            .expect("connect")
    }
}

fn write_file(path: &Path, size: usize) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    f.write_all(&data)?;
    Ok(())
}

fn rejected_code(err: ProtocolError) -> (OperationKind, u8) {
    match err {
        ProtocolError::OperationRejected {
            operation, code, ..
        } => (operation, code),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[test]
fn upload_list_download_rename_delete() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions::default())?;
    let local = tempfile::tempdir()?;
    let src = local.path().join("hello.txt");
    std::fs::write(&src, b"hello")?;

    let mut client = fx.connect("alice", "alice-pw");
    let mut progress = NoopProgress;

    let out = client.perform_operation(
        Operation::Upload {
            source: src.clone(),
            remote_name: None,
        },
        &mut progress,
    )?;
    assert_eq!(
        out,
        OperationOutcome::Uploaded {
            name: "hello.txt".into(),
            bytes: 5
        }
    );
    assert_eq!(
        std::fs::read(fx.data.path().join("alice").join("hello.txt"))?,
        b"hello"
    );

    // same name again
    let err = client
        .perform_operation(
            Operation::Upload {
                source: src.clone(),
                remote_name: None,
            },
            &mut progress,
        )
        .unwrap_err();
    assert_eq!(rejected_code(err), (OperationKind::Upload, 1));
    assert!(client.is_usable());

    let out = client.perform_operation(Operation::List, &mut progress)?;
    assert_eq!(out, OperationOutcome::Listed(vec!["hello.txt".into()]));

    let dest = tempfile::tempdir()?;
    let out = client.perform_operation(
        Operation::Download {
            name: "hello.txt".into(),
            dest_dir: dest.path().to_path_buf(),
        },
        &mut progress,
    )?;
    assert_eq!(
        out,
        OperationOutcome::Downloaded {
            path: dest.path().join("hello.txt"),
            bytes: 5
        }
    );
    assert_eq!(std::fs::read(dest.path().join("hello.txt"))?, b"hello");

    // refused before anything is sent, so the session stays in step
    let err = client
        .perform_operation(
            Operation::Download {
                name: "hello.txt".into(),
                dest_dir: dest.path().to_path_buf(),
            },
            &mut progress,
        )
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidInput(_)));
    assert!(client.is_usable());

    let err = client
        .perform_operation(
            Operation::Download {
                name: "nope.txt".into(),
                dest_dir: dest.path().to_path_buf(),
            },
            &mut progress,
        )
        .unwrap_err();
    assert_eq!(rejected_code(err), (OperationKind::Download, 1));
    assert!(!dest.path().join("nope.txt").exists());

    let err = client
        .perform_operation(
            Operation::Rename {
                from: "nope.txt".into(),
                to: "other.txt".into(),
            },
            &mut progress,
        )
        .unwrap_err();
    assert_eq!(rejected_code(err), (OperationKind::Rename, 2));

    assert_eq!(
        client.perform_operation(
            Operation::Rename {
                from: "hello.txt".into(),
                to: "greeting.txt".into(),
            },
            &mut progress,
        )?,
        OperationOutcome::Renamed
    );
    assert_eq!(
        client.perform_operation(Operation::List, &mut progress)?,
        OperationOutcome::Listed(vec!["greeting.txt".into()])
    );

    assert_eq!(
        client.perform_operation(
            Operation::Delete {
                name: "greeting.txt".into()
            },
            &mut progress,
        )?,
        OperationOutcome::Deleted
    );
    assert_eq!(
        client.perform_operation(Operation::List, &mut progress)?,
        OperationOutcome::Listed(vec![])
    );
    let err = client
        .perform_operation(
            Operation::Delete {
                name: "greeting.txt".into(),
            },
            &mut progress,
        )
        .unwrap_err();
    assert_eq!(rejected_code(err), (OperationKind::Delete, 2));

    client.logout()?;
    Ok(())
}

#[test]
fn multi_chunk_round_trip() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions::default())?;
    let local = tempfile::tempdir()?;
    let src = local.path().join("big.bin");
    write_file(&src, 300_000)?;

    let mut client = fx.connect("alice", "alice-pw");
    let mut progress = NoopProgress;
    client.perform_operation(
        Operation::Upload {
            source: src.clone(),
            remote_name: Some("copy.bin".into()),
        },
        &mut progress,
    )?;

    let dest = tempfile::tempdir()?;
    let out = client.perform_operation(
        Operation::Download {
            name: "copy.bin".into(),
            dest_dir: dest.path().to_path_buf(),
        },
        &mut progress,
    )?;
    assert_eq!(
        out,
        OperationOutcome::Downloaded {
            path: dest.path().join("copy.bin"),
            bytes: 300_000
        }
    );
    assert_eq!(std::fs::read(&src)?, std::fs::read(dest.path().join("copy.bin"))?);
    client.logout()?;
    Ok(())
}

#[test]
fn users_are_isolated() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions::default())?;
    let local = tempfile::tempdir()?;
    let src = local.path().join("secret.txt");
    std::fs::write(&src, b"alice only")?;
    let mut progress = NoopProgress;

    let mut alice = fx.connect("alice", "alice-pw");
    alice.perform_operation(
        Operation::Upload {
            source: src,
            remote_name: None,
        },
        &mut progress,
    )?;

    let mut bob = fx.connect("bob", "bob-pw");
    assert_eq!(
        bob.perform_operation(Operation::List, &mut progress)?,
        OperationOutcome::Listed(vec![])
    );
    alice.logout()?;
    bob.logout()?;
    Ok(())
}

#[test]
fn journal_records_operations() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions::default())?;
    let mut progress = NoopProgress;
    let mut client = fx.connect("alice", "alice-pw");
    client.perform_operation(Operation::List, &mut progress)?;
    let _ = client.perform_operation(
        Operation::Delete {
            name: "missing".into(),
        },
        &mut progress,
    );
    client.logout()?;

    // the server writes its entry after replying; give it a moment
    let journal = TransferLog::new(fx.data.path());
    let mut entries = Vec::new();
    for _ in 0..50 {
        entries = journal.read_log()?;
        if entries.len() >= 3 {
            break;
        }
        thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(entries.iter().all(|e| e.username == "alice"));
    let list = entries.iter().find(|e| e.operation == "list").expect("list entry");
    assert_eq!(list.status, TransferStatus::Completed);
    let delete = entries
        .iter()
        .find(|e| e.operation == "delete")
        .expect("delete entry");
    assert_eq!(delete.status, TransferStatus::Rejected);
    assert_eq!(delete.ack_code, Some(2));
    Ok(())
}

#[test]
fn unknown_user_is_refused() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions::default())?;
    let trust = TrustStore::from_dir(fx.pki.path())?;
    let key = fx.key_path("alice");
    let res = Client::connect(
        &fx.addr,
        "mallory",
        trust,
        || load_encrypted_signing_key(&key, "alice-pw"),
        ClientOptions::default(),
    );
    assert!(matches!(res, Err(ProtocolError::UnknownIdentity(_))));
    Ok(())
}

#[test]
fn wrong_passphrase_is_invalid_credential() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions::default())?;
    let res = fx.connect_with("alice", "not-the-password", ClientOptions::default());
    assert!(matches!(res, Err(ProtocolError::InvalidCredential(_))));
    Ok(())
}

#[test]
fn revoked_server_certificate_is_untrusted() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions {
        revoke_server: true,
        ..ProvisionOptions::default()
    })?;
    let res = fx.connect_with("alice", "alice-pw", ClientOptions::default());
    assert!(matches!(res, Err(ProtocolError::UntrustedCertificate(_))));
    Ok(())
}

#[test]
fn low_counter_limit_forces_rehandshake() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions::default())?;
    let opts = ClientOptions {
        counter_limit: 4,
        ..ClientOptions::default()
    };
    let mut client = fx.connect_with("alice", "alice-pw", opts)?;
    let mut progress = NoopProgress;
    for _ in 0..5 {
        assert_eq!(
            client.perform_operation(Operation::List, &mut progress)?,
            OperationOutcome::Listed(vec![])
        );
    }
    assert!(client.rehandshakes() >= 2);
    assert!(client.is_usable());

    // a download can never fit in four frames
    let dest = tempfile::tempdir()?;
    let err = client
        .perform_operation(
            Operation::Download {
                name: "x".into(),
                dest_dir: dest.path().to_path_buf(),
            },
            &mut progress,
        )
        .unwrap_err();
    assert!(matches!(err, ProtocolError::CounterExhausted));
    client.logout()?;
    Ok(())
}

#[test]
fn empty_upload_rejected_locally() -> Result<()> {
    let fx = Fixture::start(ProvisionOptions::default())?;
    let local = tempfile::tempdir()?;
    let src = local.path().join("empty");
    std::fs::write(&src, b"")?;
    let mut client = fx.connect("alice", "alice-pw");
    let err = client
        .perform_operation(
            Operation::Upload {
                source: src,
                remote_name: None,
            },
            &mut NoopProgress,
        )
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidInput(_)));
    assert!(client.is_usable());
    assert_eq!(
        client.perform_operation(Operation::List, &mut NoopProgress)?,
        OperationOutcome::Listed(vec![])
    );
    client.logout()?;
    Ok(())
}
