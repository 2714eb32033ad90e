use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::lease::{duration_ms, lease_deadline, next_fencing_token, now_ms, Lease};
use super::LockBackend;
use crate::error::{EngineError, Result};

/// Lease records on the local filesystem.
///
/// Each key maps to `<sha256>.lease` (JSON) guarded by an OS file lock on
/// `<sha256>.guard`, so read-modify-write of a record is atomic across
/// processes sharing the directory.
#[derive(Clone, Debug)]
pub struct FileLeaseBackend {
    dir: PathBuf,
}

impl FileLeaseBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        (
            self.dir.join(format!("{digest}.lease")),
            self.dir.join(format!("{digest}.guard")),
        )
    }

    /// Runs `update` on the current record while holding the guard. The
    /// guard is released when the file handle drops.
    fn with_record<T>(
        &self,
        key: &str,
        update: impl FnOnce(Option<Lease>) -> Result<(T, Option<Lease>)>,
    ) -> Result<T> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| EngineError::io(format!("failed to create {}", self.dir.display()), err))?;
        let (record, guard_path) = self.paths(key);
        let guard = open_guard(&guard_path)?;
        guard
            .lock_exclusive()
            .map_err(|err| EngineError::io(format!("failed to lock {}", guard_path.display()), err))?;

        let current = read_record(&record)?;
        let (value, next) = update(current)?;
        if let Some(next) = next {
            write_record(&record, &next)?;
        }
        drop(guard);
        Ok(value)
    }
}

impl LockBackend for FileLeaseBackend {
    fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>> {
        self.with_record(key, |current| {
            let now = now_ms();
            if let Some(lease) = current.as_ref().filter(|lease| !lease.is_expired_at(now)) {
                debug!(key, holder = %lease.holder, "lease held");
                return Ok((None, None));
            }
            if current.as_ref().is_some_and(|lease| lease.deadline_ms != 0) {
                warn!(key, "taking over expired lease");
            }
            let lease = Lease {
                key: key.to_string(),
                holder: holder.to_string(),
                fencing_token: next_fencing_token(current.as_ref()),
                deadline_ms: lease_deadline(now, duration_ms(ttl)),
            };
            Ok((Some(lease.clone()), Some(lease)))
        })
    }

    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        self.with_record(&lease.key, |current| {
            let now = now_ms();
            match current {
                Some(stored)
                    if stored.holder == lease.holder
                        && stored.fencing_token == lease.fencing_token
                        && !stored.is_expired_at(now) =>
                {
                    let renewed = Lease {
                        deadline_ms: lease_deadline(now, duration_ms(ttl)),
                        ..stored
                    };
                    Ok((renewed.clone(), Some(renewed)))
                }
                _ => Err(EngineError::LeaseLost {
                    key: lease.key.clone(),
                }),
            }
        })
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        self.with_record(&lease.key, |current| match current {
            Some(stored)
                if stored.holder == lease.holder && stored.fencing_token == lease.fencing_token =>
            {
                Ok((
                    (),
                    Some(Lease {
                        deadline_ms: 0,
                        ..stored
                    }),
                ))
            }
            // Someone else took over after expiry; nothing of ours to release.
            _ => Ok(((), None)),
        })
    }
}

fn open_guard(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| EngineError::io(format!("failed to open {}", path.display()), err))
}

fn read_record(path: &Path) -> Result<Option<Lease>> {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(lease) => Ok(Some(lease)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable lease record");
                Ok(None)
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(EngineError::io(format!("failed to read {}", path.display()), err)),
    }
}

fn write_record(path: &Path, lease: &Lease) -> Result<()> {
    let tmp = path.with_extension("lease.tmp");
    let body = serde_json::to_vec(lease).map_err(|err| {
        EngineError::io(
            format!("failed to encode lease for {}", lease.key),
            io::Error::other(err),
        )
    })?;
    fs::write(&tmp, body)
        .and_then(|()| fs::rename(&tmp, path))
        .map_err(|err| EngineError::io(format!("failed to write {}", path.display()), err))
}
