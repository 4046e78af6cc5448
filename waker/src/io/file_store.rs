//! Filesystem-backed state store.
//!
//! Layout: `<dir>/<key>/<version:020>.json`, one immutable file per committed
//! version. A commit writes a temp file, then hard-links it to the successor
//! version's name; the link fails if another writer already claimed that
//! version, which makes the compare-and-swap atomic across processes.
//!
//! Writers also hold an advisory lock on `<dir>/<key>/.lock` from the
//! latest-version check until pruning is done, so a pruned version number
//! cannot be linked again by a writer that checked before the prune.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::core::state::AgentState;
use crate::io::state_store::{
    Committed, Loaded, StateStore, StoreError, check_commit, decode_state, encode_state,
};

const LOCK_FILE_NAME: &str = ".lock";

static VERSION_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{20})\.json$").expect("version file pattern"));

/// Versioned JSON documents in a directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    key: String,
    dir: PathBuf,
    retain_versions: usize,
}

impl FileStateStore {
    /// `dir` is the store root; the document lives in `dir/key`.
    pub fn new(dir: impl AsRef<Path>, key: impl Into<String>, retain_versions: usize) -> Self {
        let key = key.into();
        Self {
            dir: dir.as_ref().join(&key),
            key,
            retain_versions: retain_versions.max(1),
        }
    }

    /// Directory holding this agent's version files.
    pub fn document_dir(&self) -> &Path {
        &self.dir
    }

    fn version_path(&self, version: u64) -> PathBuf {
        self.dir.join(version_file_name(version))
    }

    /// Committed versions present on disk, ascending.
    async fn versions(&self) -> Result<Vec<u64>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(unavailable("read store dir", &self.dir, &err)),
        };
        let mut versions = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(unavailable("list store dir", &self.dir, &err)),
            };
            let name = entry.file_name();
            if let Some(version) = name.to_str().and_then(parse_version_file_name) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn latest_version(&self) -> Result<u64, StoreError> {
        Ok(self.versions().await?.last().copied().unwrap_or(0))
    }

    /// Take the exclusive commit lock. Released when the file is dropped.
    async fn lock_commits(&self) -> Result<std::fs::File, StoreError> {
        let path = self.dir.join(LOCK_FILE_NAME);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|err| unavailable("open commit lock", &path, &err))?;
            file.lock()
                .map_err(|err| unavailable("take commit lock", &path, &err))?;
            Ok(file)
        })
        .await
        .map_err(|err| StoreError::Unavailable(format!("commit lock worker failed: {err}")))?
    }

    /// A linked version only counts if nothing newer appeared meanwhile.
    ///
    /// A writer that skips the commit lock can commit and prune past `next`
    /// between our latest-version check and the link, so a stale `next` file
    /// can link successfully. That link is withdrawn and reported as a
    /// conflict.
    async fn confirm_latest(
        &self,
        target: &Path,
        expected_version: u64,
        next: u64,
    ) -> Result<Committed, StoreError> {
        let latest = self.latest_version().await?;
        if latest == next {
            return Ok(Committed { version: next });
        }
        warn!(next, latest, "newer version committed during link, withdrawing");
        match tokio::fs::remove_file(target).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(unavailable("withdraw stale state file", target, &err)),
        }
        Err(StoreError::VersionConflict {
            expected: expected_version,
            found: latest,
        })
    }

    async fn write_temp(&self, raw: &str) -> Result<PathBuf, StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| unavailable("create store dir", &self.dir, &err))?;
        let tmp = self
            .dir
            .join(format!(".tmp-{}.json", Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|err| unavailable("create temp file", &tmp, &err))?;
        let written = async {
            file.write_all(raw.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            remove_temp(&tmp).await;
            return Err(unavailable("write temp file", &tmp, &err));
        }
        Ok(tmp)
    }

    /// Remove the oldest versions beyond the retention window.
    async fn prune(&self) {
        let versions = match self.versions().await {
            Ok(versions) => versions,
            Err(err) => {
                warn!(key = %self.key, err = %err, "skipping prune");
                return;
            }
        };
        if versions.len() <= self.retain_versions {
            return;
        }
        let excess = versions.len() - self.retain_versions;
        for version in &versions[..excess] {
            let path = self.version_path(*version);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(key = %self.key, version, "pruned old version"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "failed to prune old version");
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip_all, fields(key = %self.key))]
    async fn load(&self) -> Result<Loaded, StoreError> {
        // A concurrent prune can remove the file between listing and reading;
        // list again once before giving up.
        for _ in 0..2 {
            let Some(version) = self.versions().await?.last().copied() else {
                return Err(StoreError::NotFound {
                    key: self.key.clone(),
                });
            };
            let path = self.version_path(version);
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) if err.kind() == ErrorKind::InvalidData => {
                    return Err(StoreError::Malformed(format!(
                        "{} is not valid UTF-8",
                        path.display()
                    )));
                }
                Err(err) => return Err(unavailable("read state file", &path, &err)),
            };
            let state = decode_state(&raw)
                .map_err(|err| annotate_malformed(err, &path))?;
            if state.version != version {
                return Err(StoreError::Malformed(format!(
                    "{}: document version {} does not match file name",
                    path.display(),
                    state.version
                )));
            }
            debug!(version, "loaded agent state");
            return Ok(Loaded { state, version });
        }
        Err(StoreError::Unavailable(format!(
            "state files under {} changed while loading",
            self.dir.display()
        )))
    }

    #[instrument(skip_all, fields(key = %self.key, expected_version = expected_version))]
    async fn save(
        &self,
        state: &AgentState,
        expected_version: u64,
    ) -> Result<Committed, StoreError> {
        let next = check_commit(state, expected_version)?;
        let raw = encode_state(state)?;
        let tmp = self.write_temp(&raw).await?;
        let lock = match self.lock_commits().await {
            Ok(lock) => lock,
            Err(err) => {
                remove_temp(&tmp).await;
                return Err(err);
            }
        };

        let result = async {
            let found = self.latest_version().await?;
            if found != expected_version {
                return Err(StoreError::VersionConflict {
                    expected: expected_version,
                    found,
                });
            }
            let target = self.version_path(next);
            match tokio::fs::hard_link(&tmp, &target).await {
                Ok(()) => self.confirm_latest(&target, expected_version, next).await,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    Err(StoreError::VersionConflict {
                        expected: expected_version,
                        found: next,
                    })
                }
                Err(err) => Err(unavailable("link state file", &target, &err)),
            }
        }
        .await;
        remove_temp(&tmp).await;

        let committed = match result {
            Ok(committed) => committed,
            Err(err) => {
                drop(lock);
                return Err(err);
            }
        };
        debug!(version = committed.version, "agent state committed");
        self.prune().await;
        drop(lock);
        Ok(committed)
    }
}

fn version_file_name(version: u64) -> String {
    format!("{version:020}.json")
}

/// Version committed by a document file name such as `00000000000000000007.json`.
pub fn parse_version_file_name(name: &str) -> Option<u64> {
    VERSION_FILE_RE
        .captures(name)
        .and_then(|caps| caps[1].parse().ok())
}

fn unavailable(action: &str, path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{action} {}: {err}", path.display()))
}

fn annotate_malformed(err: StoreError, path: &Path) -> StoreError {
    match err {
        StoreError::Malformed(msg) => StoreError::Malformed(format!("{}: {msg}", path.display())),
        other => other,
    }
}

async fn remove_temp(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), err = %err, "failed to remove temp file");
    }
}
