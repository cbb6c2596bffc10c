//! Transfer tasks
//!
//! A [`TransferTask`] names a source, a destination and optionally where to
//! connect. Every remote operation on a task opens its own session and
//! releases it before returning.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::archive::pack;
use crate::error::{Result, TransferError};
use crate::path::to_remote;
use crate::progress::ProgressSink;
use crate::session::{RemoteTarget, SessionProvider};
use crate::ship::{ship, ShipOptions};
use crate::unpack::unpack;

#[derive(Clone, Debug)]
pub struct TransferTask {
    pub source: PathBuf,
    pub destination: String,
    pub target: Option<RemoteTarget>,
}

impl TransferTask {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: RemoteTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn target(&self) -> Result<&RemoteTarget> {
        self.target
            .as_ref()
            .ok_or_else(|| TransferError::Connect("no remote target configured".into()))
    }

    /// Ship the local archive at `source` to the remote path `destination`
    pub fn ship<P: SessionProvider>(
        &self,
        provider: &P,
        options: &ShipOptions,
        sink: &dyn ProgressSink,
    ) -> Result<String> {
        let session = provider.connect(self.target()?)?;
        ship(session, &self.source, &self.destination, options, sink)
    }

    /// Extract the remote archive `source` into the remote directory
    /// `destination`
    pub fn unpack<P: SessionProvider>(&self, provider: &P, sink: &dyn ProgressSink) -> Result<String> {
        let session = provider.connect(self.target()?)?;
        unpack(session, &to_remote(&self.source), &self.destination, sink)
    }

    /// Pack the local directory `source`, ship it next to the remote
    /// directory `destination` and extract it there.
    ///
    /// The archive is staged at `staging` and removed afterwards. Shipping
    /// and extraction each use a fresh session.
    pub fn send<P: SessionProvider>(
        &self,
        provider: &P,
        staging: &Path,
        options: &ShipOptions,
        sink: &dyn ProgressSink,
    ) -> Result<String> {
        let target = self.target()?;
        let archive = pack(&self.source, staging, sink)?;
        let remote_archive = remote_archive_for(&self.destination);

        let result = ship(provider.connect(target)?, &archive, &remote_archive, options, sink)
            .and_then(|_| unpack(provider.connect(target)?, &remote_archive, &self.destination, sink));

        if let Err(e) = fs::remove_file(&archive) {
            warn!("failed to remove staged archive {:?}: {}", archive, e);
        }

        let destination = result?;
        info!("Sent {:?} to {}:{}", self.source, target.address(), destination);
        Ok(destination)
    }
}

/// Remote archive path used by [`TransferTask::send`]: a sibling of the
/// destination directory
pub fn remote_archive_for(destination: &str) -> String {
    let trimmed = destination.trim_end_matches('/');
    if trimmed.is_empty() {
        "/tarship-upload.tar".to_string()
    } else {
        format!("{}.tar", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgress;
    use crate::session::LocalSession;
    use std::cell::Cell;
    use tempfile::tempdir;

    /// Hands out local sessions over one directory and counts connects
    struct LocalProvider {
        root: PathBuf,
        connects: Cell<usize>,
        password: String,
    }

    impl SessionProvider for LocalProvider {
        type Session = LocalSession;

        fn connect(&self, target: &RemoteTarget) -> Result<LocalSession> {
            if target.credential != self.password {
                return Err(TransferError::Auth("bad credentials".into()));
            }
            self.connects.set(self.connects.get() + 1);
            Ok(LocalSession::new(&self.root))
        }
    }

    fn provider(root: &Path) -> LocalProvider {
        LocalProvider {
            root: root.to_path_buf(),
            connects: Cell::new(0),
            password: "secret".into(),
        }
    }

    fn target(password: &str) -> RemoteTarget {
        RemoteTarget::new("localhost", 4433, "alice", password)
    }

    #[test]
    fn test_remote_archive_for() {
        assert_eq!(remote_archive_for("/srv/site/"), "/srv/site.tar");
        assert_eq!(remote_archive_for("out"), "out.tar");
        assert_eq!(remote_archive_for("/"), "/tarship-upload.tar");
    }

    #[test]
    fn test_missing_target_is_connect_error() {
        let temp = tempdir().unwrap();
        let task = TransferTask::new(temp.path().join("a.tar"), "/a.tar");
        let err = task
            .ship(&provider(temp.path()), &ShipOptions::default(), &NullProgress)
            .unwrap_err();
        assert!(matches!(err, TransferError::Connect(_)));
    }

    #[test]
    fn test_send_thousand_empty_files() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        fs::create_dir(&source).unwrap();
        for i in 0..1000 {
            fs::File::create(source.join(format!("file_{}.txt", i))).unwrap();
        }
        let remote = temp.path().join("remote");
        fs::create_dir(&remote).unwrap();

        let provider = provider(&remote);
        let staging = temp.path().join("staging/source.tar");
        let task = TransferTask::new(&source, "/data/destination").with_target(target("secret"));

        let out = task
            .send(&provider, &staging, &ShipOptions::default(), &NullProgress)
            .unwrap();
        assert_eq!(out, "/data/destination");
        assert_eq!(provider.connects.get(), 2);
        assert!(!staging.exists());

        assert!(fs::metadata(remote.join("data/destination.tar")).unwrap().len() > 0);
        let extracted = remote.join("data/destination");
        for i in 0..1000 {
            let meta = fs::metadata(extracted.join(format!("file_{}.txt", i))).unwrap();
            assert_eq!(meta.len(), 0);
        }
        assert_eq!(fs::read_dir(&extracted).unwrap().count(), 1000);
    }

    #[test]
    fn test_send_with_wrong_credential() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("a.txt"), b"a").unwrap();

        let provider = provider(temp.path());
        let staging = temp.path().join("s.tar");
        let task = TransferTask::new(&source, "/out").with_target(target("wrong"));

        let err = task
            .send(&provider, &staging, &ShipOptions::default(), &NullProgress)
            .unwrap_err();
        assert!(matches!(err, TransferError::Auth(_)));
        assert!(!staging.exists());
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn test_ship_then_unpack_tasks() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("tree");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/x.txt"), b"xyz").unwrap();
        let archive = pack(&source, &temp.path().join("tree.tar"), &NullProgress).unwrap();

        let remote = temp.path().join("remote");
        fs::create_dir(&remote).unwrap();
        let provider = provider(&remote);

        TransferTask::new(&archive, "/uploads/tree.tar")
            .with_target(target("secret"))
            .ship(&provider, &ShipOptions::default(), &NullProgress)
            .unwrap();
        TransferTask::new("/uploads/tree.tar", "/live")
            .with_target(target("secret"))
            .unpack(&provider, &NullProgress)
            .unwrap();

        assert_eq!(fs::read(remote.join("live/sub/x.txt")).unwrap(), b"xyz");
    }
}
