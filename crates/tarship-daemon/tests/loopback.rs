//! End-to-end transfers against a host on the loopback interface

use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use tarship_core::crypto::{credential_digest, CertFingerprint};
use tarship_core::{
    NullProgress, ProgressEvent, RemoteTarget, SecureSession, SessionProvider, ShipOptions,
    TransferError, TransferTask,
};
use tarship_daemon::{HostConfig, QuicConnector, RateLimiterConfig, TarshipHost};

const USER: &str = "deploy";
const PASSWORD: &str = "correct horse battery staple";

struct Loopback {
    connector: QuicConnector,
    addr: SocketAddr,
    fingerprint: CertFingerprint,
    root: TempDir,
}

impl Loopback {
    fn start() -> Self {
        let root = TempDir::new().unwrap();
        let connector = QuicConnector::new().unwrap();
        let runtime = connector.runtime().clone();

        let config = HostConfig::new("127.0.0.1:0".parse().unwrap(), root.path())
            .with_user(USER, credential_digest(USER, PASSWORD));
        let host = {
            let _guard = runtime.enter();
            Arc::new(TarshipHost::bind(config).unwrap())
        };
        let addr = host.local_addr().unwrap();
        let fingerprint = host.fingerprint();

        runtime.spawn(async move {
            let _ = host.serve().await;
        });

        Self {
            connector,
            addr,
            fingerprint,
            root,
        }
    }

    fn target(&self, user: &str, password: &str) -> RemoteTarget {
        let mut target = RemoteTarget::new("127.0.0.1", self.addr.port(), user, password);
        target.fingerprint = Some(self.fingerprint);
        target
    }
}

fn sample_tree() -> TempDir {
    let source = TempDir::new().unwrap();
    fs::create_dir_all(source.path().join("assets/img")).unwrap();
    fs::write(source.path().join("index.html"), b"<h1>hello</h1>").unwrap();
    fs::write(source.path().join("assets/app.js"), b"console.log(1);").unwrap();
    fs::write(source.path().join("assets/img/logo.bin"), vec![7u8; 300_000]).unwrap();
    fs::create_dir(source.path().join("empty")).unwrap();
    source
}

#[test]
fn test_send_round_trip() {
    let host = Loopback::start();
    let source = sample_tree();
    let staging = TempDir::new().unwrap();

    let task = TransferTask::new(source.path(), "/releases/site").with_target(host.target(USER, PASSWORD));
    let destination = task
        .send(
            &host.connector,
            &staging.path().join("site.tar"),
            &ShipOptions::default(),
            &NullProgress,
        )
        .unwrap();
    assert_eq!(destination, "/releases/site");

    let site = host.root.path().join("releases/site");
    assert_eq!(fs::read(site.join("index.html")).unwrap(), b"<h1>hello</h1>");
    assert_eq!(fs::read(site.join("assets/app.js")).unwrap(), b"console.log(1);");
    assert_eq!(fs::read(site.join("assets/img/logo.bin")).unwrap(), vec![7u8; 300_000]);
    assert!(site.join("empty").is_dir());

    // The shipped archive stays next to the destination; the staged copy is gone
    assert!(host.root.path().join("releases/site.tar").is_file());
    assert!(!staging.path().join("site.tar").exists());
}

#[test]
fn test_ship_in_chunks() {
    let host = Loopback::start();
    let local = TempDir::new().unwrap();
    let archive = local.path().join("big.tar");
    let data: Vec<u8> = (0..(3 * 1024 * 1024 + 17)).map(|i| (i % 251) as u8).collect();
    fs::write(&archive, &data).unwrap();

    let options = ShipOptions {
        chunk_size: 1024 * 1024,
        create_parent: true,
    };
    let shipped = AtomicU64::new(0);
    let sink = |event: &ProgressEvent<'_>| {
        if let ProgressEvent::Advanced { delta, .. } = event {
            shipped.fetch_add(*delta, Ordering::Relaxed);
        }
    };

    let task = TransferTask::new(&archive, "/incoming/big.tar").with_target(host.target(USER, PASSWORD));
    let remote = task.ship(&host.connector, &options, &sink).unwrap();

    assert_eq!(remote, "/incoming/big.tar");
    assert_eq!(shipped.load(Ordering::Relaxed), data.len() as u64);
    assert_eq!(fs::read(host.root.path().join("incoming/big.tar")).unwrap(), data);
}

#[test]
fn test_wrong_password_is_auth_error() {
    let host = Loopback::start();

    match host.connector.connect(&host.target(USER, "wrong")) {
        Err(TransferError::Auth(_)) => {}
        Err(other) => panic!("expected Auth, got {}", other),
        Ok(_) => panic!("wrong password was accepted"),
    }
}

#[test]
fn test_repeated_wrong_passwords_lock_out_the_address() {
    let host = Loopback::start();
    let max_failures = RateLimiterConfig::default().max_failures;

    for _ in 0..max_failures + 2 {
        match host.connector.connect(&host.target(USER, "guess")) {
            Err(TransferError::Auth(_)) => {}
            Err(other) => panic!("expected Auth, got {}", other),
            Ok(_) => panic!("wrong password was accepted"),
        }
    }

    // Even the right password is turned away while the lockout lasts
    match host.connector.connect(&host.target(USER, PASSWORD)) {
        Err(TransferError::Auth(reason)) => assert!(reason.contains("failed logins"), "{}", reason),
        Err(other) => panic!("expected Auth, got {}", other),
        Ok(_) => panic!("login succeeded during lockout"),
    }
}

#[test]
fn test_unknown_user_is_auth_error() {
    let host = Loopback::start();

    match host.connector.connect(&host.target("mallory", PASSWORD)) {
        Err(TransferError::Auth(_)) => {}
        Err(other) => panic!("expected Auth, got {}", other),
        Ok(_) => panic!("unknown user was accepted"),
    }
}

#[test]
fn test_pinned_fingerprint_mismatch_is_connect_error() {
    let host = Loopback::start();
    let mut target = host.target(USER, PASSWORD);
    target.fingerprint = Some([0u8; 32]);

    match host.connector.connect(&target) {
        Err(TransferError::Connect(_)) => {}
        Err(other) => panic!("expected Connect, got {}", other),
        Ok(_) => panic!("mismatched certificate was accepted"),
    }
}

#[test]
fn test_unpack_missing_archive() {
    let host = Loopback::start();

    let task = TransferTask::new("/nope.tar", "/out").with_target(host.target(USER, PASSWORD));
    match task.unpack(&host.connector, &NullProgress) {
        Err(TransferError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test]
fn test_session_requests() {
    let host = Loopback::start();
    let mut session = host.connector.connect(&host.target(USER, PASSWORD)).unwrap();

    session.make_dir("/a").unwrap();
    session.make_dir("/a").unwrap();
    assert!(host.root.path().join("a").is_dir());

    let err = session.make_dir("/../escape").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);

    let err = session.stat("/a/missing").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

    session.close().unwrap();
    assert!(session.make_dir("/b").is_err());
}
