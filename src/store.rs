//! Durable VPC records
//!
//! One pretty-printed JSON file per VPC under the state directory, written
//! through a temp file in the same directory and renamed into place so a
//! reader never sees a torn record. Mutations are serialised with one
//! `flock(2)` lock file per VPC under `<state_dir>/locks`.

use crate::error::{Error, Result};
use crate::manifest::RetryConfig;
use crate::model::{Vpc, validate_name};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use rand::rng;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

const RECORD_EXT: &str = "json";

/// Create backoff strategy from RetryConfig
fn backoff_from_config(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

/// Exclusive locks held on a set of VPC names, released on drop
pub struct LockSet {
    _locks: Vec<Flock<File>>,
}

/// The resource store
pub struct ResourceStore {
    dir: PathBuf,
    lock_dir: PathBuf,
    lock_timeout: Duration,
    retry: RetryConfig,
}

impl ResourceStore {
    /// Open a store rooted at `dir`; directories are created on first write
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration, retry: RetryConfig) -> Self {
        let dir = dir.into();
        Self {
            lock_dir: dir.join("locks"),
            dir,
            lock_timeout,
            retry,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file for `name`; names that could leave the state directory
    /// are rejected
    fn record_path(&self, name: &str) -> Result<PathBuf> {
        validate_name("VPC", name)?;
        Ok(self.dir.join(format!("{}.{}", name, RECORD_EXT)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).is_ok_and(|p| p.is_file())
    }

    /// Read a record, `None` if it does not exist
    pub fn load(&self, name: &str) -> Result<Option<Vpc>> {
        let vpc = self.load_unchecked(name)?;
        if let Some(vpc) = &vpc {
            vpc.validate()?;
        }
        Ok(vpc)
    }

    /// Read a record without checking its invariants
    ///
    /// Only for teardown of a record that no longer validates; the file must
    /// still parse and hold the VPC it is named after.
    pub fn load_unchecked(&self, name: &str) -> Result<Option<Vpc>> {
        let path = self.record_path(name)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let vpc: Vpc = serde_json::from_str(&content).map_err(|e| Error::CorruptRecord {
            vpc: name.to_string(),
            reason: e.to_string(),
        })?;

        if vpc.name != name {
            return Err(Error::CorruptRecord {
                vpc: name.to_string(),
                reason: format!("file holds VPC '{}'", vpc.name),
            });
        }

        Ok(Some(vpc))
    }

    /// Read a record that must exist
    pub fn get(&self, name: &str) -> Result<Vpc> {
        self.load(name)?
            .ok_or_else(|| Error::VpcNotFound(name.to_string()))
    }

    /// Every readable record; unreadable ones are skipped with a warning
    pub fn list(&self) -> Result<Vec<Vpc>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut vpcs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            match self.load(name) {
                Ok(Some(vpc)) => vpcs.push(vpc),
                // Removed between read_dir and load
                Ok(None) => {}
                Err(e) => warn!(vpc = name, error = %e, "skipping unreadable record"),
            }
        }

        Ok(vpcs)
    }

    /// Atomically replace (or create) a record
    pub fn save(&self, vpc: &Vpc) -> Result<()> {
        vpc.validate()?;
        fs::create_dir_all(&self.dir)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), vpc)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path(&vpc.name)?)
            .map_err(|e| Error::Io(e.error))?;

        debug!(vpc = %vpc.name, "record saved");
        Ok(())
    }

    /// Delete a record; a missing record is not an error
    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.record_path(name)?) {
            Ok(()) => {
                debug!(vpc = name, "record removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Commit two records as one unit
    ///
    /// If the second write fails the first record is restored to `before.0`,
    /// leaving both files as they were.
    pub fn commit_pair(&self, after: (&Vpc, &Vpc), before: (&Vpc, &Vpc)) -> Result<()> {
        self.save(after.0)?;

        if let Err(e) = self.save(after.1) {
            if let Err(restore) = self.save(before.0) {
                error!(
                    vpc = %before.0.name,
                    error = %restore,
                    "failed to restore record after aborted commit"
                );
            }
            return Err(Error::Commit {
                vpc: after.1.name.clone(),
                message: e.to_string(),
            });
        }

        Ok(())
    }

    /// Take exclusive locks on `names` in lexicographic order
    pub fn lock(&self, names: &[&str]) -> Result<LockSet> {
        let mut sorted: Vec<&str> = names.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        for name in &sorted {
            validate_name("VPC", name)?;
        }

        fs::create_dir_all(&self.lock_dir)?;
        let deadline = Instant::now() + self.lock_timeout;

        let mut locks = Vec::with_capacity(sorted.len());
        for name in &sorted {
            locks.push(self.acquire(name, deadline)?);
        }

        Ok(LockSet { _locks: locks })
    }

    fn acquire(&self, name: &str, deadline: Instant) -> Result<Flock<File>> {
        let path = self.lock_dir.join(format!("{}.lock", name));
        let mut file = File::options()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Lock {
                name: name.to_string(),
                message: format!("{}: {}", path.display(), e),
            })?;

        let backoff = backoff_from_config(&self.retry);
        let mut rng = rng();
        let mut attempt: u8 = 0;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    debug!(name, "lock acquired");
                    return Ok(lock);
                }
                Err((f, Errno::EWOULDBLOCK)) => {
                    file = f;
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::LockTimeout {
                            name: name.to_string(),
                            secs: self.lock_timeout.as_secs(),
                        });
                    }

                    attempt = attempt.saturating_add(1).min(self.retry.max_attempts.max(1));
                    let delay_ms = backoff
                        .delay(attempt, &mut rng)
                        .unwrap_or(self.retry.max_delay_ms);
                    let wait = Duration::from_millis(delay_ms).min(deadline - now);
                    debug!(name, attempt, ?wait, "lock busy, retrying");
                    thread::sleep(wait);
                }
                Err((_, errno)) => {
                    return Err(Error::Lock {
                        name: name.to_string(),
                        message: errno.to_string(),
                    });
                }
            }
        }
    }
}
