//! Store directory, metadata file, and tree scanner (component C3).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;
use walkdir::WalkDir;

use crate::diskutil::DiskOps;
use crate::error::BlobError;
use crate::locking::{self, AccessMode, LockHandle};
use crate::sidecar::{self, StoreFormat, Suffix};
use crate::tools::random_hex_id;

pub const STORE_META_FILE: &str = ".blobstore";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevocationPolicy {
    None,
    Lru,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotPolicy {
    None,
    Dm,
}

bitflags! {
    /// Which non-exclusive reasons keep a blob from being purged/deleted.
    pub struct InUseMask: u8 {
        /// This process (or another) holds a write lock on `blocks`.
        const OPENED = 0b001;
        /// Another blob's `deps` lists this one (something snapshots/maps it).
        const MAPPED = 0b010;
        /// This blob's own `deps` is non-empty (it snapshots/maps others).
        const BACKED = 0b100;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreMeta {
    pub id: String,
    pub limit_blocks: u64,
    pub revocation: RevocationPolicy,
    pub snapshot: SnapshotPolicy,
    pub format: StoreFormat,
}

fn serialize_meta(meta: &StoreMeta) -> String {
    format!(
        "id: {}\nlimit: {}\nrevocation: {}\nsnapshot: {}\nformat: {}\n",
        meta.id,
        meta.limit_blocks,
        match meta.revocation {
            RevocationPolicy::None => 0,
            RevocationPolicy::Lru => 1,
        },
        match meta.snapshot {
            SnapshotPolicy::None => 0,
            SnapshotPolicy::Dm => 1,
        },
        match meta.format {
            StoreFormat::Files => 0,
            StoreFormat::Directory => 1,
        },
    )
}

fn parse_meta(raw: &str) -> Result<StoreMeta, BlobError> {
    if raw.len() < 30 {
        return Err(BlobError::noent("store metadata file is too short"));
    }

    let mut id = None;
    let mut limit = None;
    let mut revocation = None;
    let mut snapshot = None;
    let mut format = None;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| BlobError::noent(format!("malformed metadata line: {:?}", line)))?;
        let value = value.trim();
        match key.trim() {
            "id" => id = Some(value.to_string()),
            "limit" => {
                limit = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| BlobError::noent("malformed limit value"))?,
                )
            }
            "revocation" => {
                revocation = Some(match value.parse::<i64>() {
                    Ok(0) => RevocationPolicy::None,
                    Ok(1) => RevocationPolicy::Lru,
                    _ => return Err(BlobError::noent("malformed revocation value")),
                })
            }
            "snapshot" => {
                snapshot = Some(match value.parse::<i64>() {
                    Ok(0) => SnapshotPolicy::None,
                    Ok(1) => SnapshotPolicy::Dm,
                    _ => return Err(BlobError::noent("malformed snapshot value")),
                })
            }
            "format" => {
                format = Some(match value.parse::<i64>() {
                    Ok(0) => StoreFormat::Files,
                    Ok(1) => StoreFormat::Directory,
                    _ => return Err(BlobError::noent("malformed format value")),
                })
            }
            other => {
                log::warn!("ignoring unknown key {:?} in store metadata", other);
            }
        }
    }

    Ok(StoreMeta {
        id: id.ok_or_else(|| BlobError::noent("missing id in store metadata"))?,
        limit_blocks: limit.ok_or_else(|| BlobError::noent("missing limit in store metadata"))?,
        revocation: revocation.ok_or_else(|| BlobError::noent("missing revocation in store metadata"))?,
        snapshot: snapshot.ok_or_else(|| BlobError::noent("missing snapshot in store metadata"))?,
        format: format.ok_or_else(|| BlobError::noent("missing format in store metadata"))?,
    })
}

/// A snapshot of an on-disk blob as found by [`BlobStore::scan`].
#[derive(Clone, Debug)]
pub struct BlobRecord {
    pub id: String,
    pub size_blocks: u64,
    pub last_accessed: SystemTime,
    pub last_modified: SystemTime,
    pub in_use: InUseMask,
}

/// A held writer lock on the store's metadata file, serializing structural
/// mutations (create/delete/scan-and-purge) across threads and processes.
pub struct StoreLockGuard(Option<LockHandle>);

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            if let Err(e) = locking::release(handle) {
                log::error!("failed to release store lock on drop: {}", e);
            }
        }
    }
}

pub struct BlobStore {
    root: PathBuf,
    meta: StoreMeta,
    pub(crate) disk: Arc<dyn DiskOps>,
}

impl BlobStore {
    /// Open (creating if absent) the store rooted at `root`.
    ///
    /// `limit_blocks` is required the first time a store is created;
    /// `format`/`revocation`/`snapshot` of `None` mean "accept whatever the
    /// store already has" on reopen, or "use the default" on create. Any
    /// explicitly supplied value that disagrees with what's already on disk
    /// fails `INVAL`.
    pub fn open(
        root: &Path,
        limit_blocks: Option<u64>,
        format: Option<StoreFormat>,
        revocation: Option<RevocationPolicy>,
        snapshot: Option<SnapshotPolicy>,
        disk: Arc<dyn DiskOps>,
        timeout: Option<Duration>,
    ) -> Result<BlobStore, BlobError> {
        std::fs::create_dir_all(root).map_err(BlobError::from)?;
        let meta_path = root.join(STORE_META_FILE);

        // Fail before ever taking the create-lock when we know creation
        // would be rejected anyway: once the lock is held, every exit path
        // must release it, and a `?` inside the `Ok(handle)` arm below would
        // return without releasing and brick the path for good (the lock
        // registry has no reference-counted `Drop` to fall back on).
        if limit_blocks.is_none() && !meta_path.exists() {
            return Err(BlobError::inval(
                "limit_blocks is required to create a store",
            ));
        }

        match locking::acquire(
            &meta_path,
            AccessMode::ReadWriteCreateExcl,
            Some(Duration::ZERO),
            0o600,
        ) {
            Ok(handle) => {
                let meta_result = limit_blocks
                    .ok_or_else(|| BlobError::inval("limit_blocks is required to create a store"))
                    .map(|limit| StoreMeta {
                        id: random_hex_id(16),
                        limit_blocks: limit,
                        revocation: revocation.unwrap_or(RevocationPolicy::None),
                        snapshot: snapshot.unwrap_or(SnapshotPolicy::Dm),
                        format: format.unwrap_or(StoreFormat::Files),
                    })
                    .and_then(|meta| {
                        std::fs::write(&meta_path, serialize_meta(&meta)).map_err(BlobError::from)
                    });
                locking::release(handle)?;
                meta_result?;
            }
            Err(BlobError::Exist(_)) => {}
            Err(e) => return Err(e),
        }

        let handle = locking::acquire(&meta_path, AccessMode::ReadOnly, timeout, 0)?;
        let raw = std::fs::read_to_string(&meta_path).map_err(BlobError::from);
        locking::release(handle)?;
        let meta = parse_meta(&raw?)?;

        if let Some(l) = limit_blocks {
            if l != meta.limit_blocks {
                return Err(BlobError::inval("store limit_blocks mismatch"));
            }
        }
        if let Some(f) = format {
            if f != meta.format {
                return Err(BlobError::inval("store format mismatch"));
            }
        }
        if let Some(r) = revocation {
            if r != meta.revocation {
                return Err(BlobError::inval("store revocation policy mismatch"));
            }
        }
        if let Some(s) = snapshot {
            if s != meta.snapshot {
                return Err(BlobError::inval("store snapshot policy mismatch"));
            }
        }

        Ok(BlobStore {
            root: root.to_path_buf(),
            meta,
            disk,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn format(&self) -> StoreFormat {
        self.meta.format
    }

    /// Acquire the store-wide structural lock.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<StoreLockGuard, BlobError> {
        let meta_path = self.root.join(STORE_META_FILE);
        let handle = locking::acquire(&meta_path, AccessMode::ReadWrite, timeout, 0)?;
        Ok(StoreLockGuard(Some(handle)))
    }

    pub fn unlock(&self, guard: StoreLockGuard) -> Result<(), BlobError> {
        drop(guard);
        Ok(())
    }

    /// Recursively enumerate every blob under the store root, classifying
    /// its in-use status with a non-blocking writer-lock probe.
    pub fn scan(&self) -> Result<Vec<BlobRecord>, BlobError> {
        let mut records = Vec::new();

        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path == self.root.join(STORE_META_FILE) {
                continue;
            }
            let is_hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if is_hidden {
                continue;
            }

            let (suffix, id) = match sidecar::classify(&self.root, self.meta.format, path) {
                Some(v) => v,
                None => continue,
            };
            if suffix != Suffix::Blocks {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| {
                BlobError::Unknown(format!("stat {:?} failed: {}", path, e))
            })?;
            let size_blocks = metadata.len() / 512;
            let last_modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let last_accessed = metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH);

            let in_use = self.probe_in_use(&id)?;

            records.push(BlobRecord {
                id,
                size_blocks,
                last_accessed,
                last_modified,
                in_use,
            });
        }

        Ok(records)
    }

    fn probe_in_use(&self, id: &str) -> Result<InUseMask, BlobError> {
        let mut mask = InUseMask::empty();

        let blocks_path = sidecar::sidecar_path(&self.root, self.meta.format, id, Suffix::Blocks);
        match locking::acquire(
            &blocks_path,
            AccessMode::ReadWrite,
            Some(Duration::ZERO),
            0,
        ) {
            Ok(handle) => {
                locking::release(handle)?;
            }
            Err(_) => mask |= InUseMask::OPENED,
        }

        if !sidecar::read_lines(&self.root, self.meta.format, id, Suffix::Refs)?.is_empty() {
            mask |= InUseMask::MAPPED;
        }
        if !sidecar::read_lines(&self.root, self.meta.format, id, Suffix::Deps)?.is_empty() {
            mask |= InUseMask::BACKED;
        }

        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskutil::fake::FakeDiskOps;

    fn fake_disk() -> Arc<dyn DiskOps> {
        Arc::new(FakeDiskOps::new())
    }

    #[test]
    fn meta_round_trips_through_serialize_parse() {
        let meta = StoreMeta {
            id: "0123456789abcdef".to_string(),
            limit_blocks: 4096,
            revocation: RevocationPolicy::Lru,
            snapshot: SnapshotPolicy::Dm,
            format: StoreFormat::Directory,
        };
        let raw = serialize_meta(&meta);
        assert!(raw.len() >= 30);
        let parsed = parse_meta(&raw).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn open_creates_then_reopens_with_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let store1 = BlobStore::open(
            dir.path(),
            Some(1000),
            None,
            None,
            None,
            fake_disk(),
            None,
        )
        .unwrap();
        assert_eq!(store1.meta().limit_blocks, 1000);
        assert_eq!(store1.meta().revocation, RevocationPolicy::None);
        assert_eq!(store1.meta().snapshot, SnapshotPolicy::Dm);

        let store2 = BlobStore::open(dir.path(), None, None, None, None, fake_disk(), None).unwrap();
        assert_eq!(store1.meta().id, store2.meta().id);
    }

    #[test]
    fn open_rejects_mismatched_limit() {
        let dir = tempfile::tempdir().unwrap();
        BlobStore::open(dir.path(), Some(1000), None, None, None, fake_disk(), None).unwrap();
        let err = BlobStore::open(dir.path(), Some(2000), None, None, None, fake_disk(), None)
            .unwrap_err();
        assert_eq!(err.kind(), "INVAL");
    }

    #[test]
    fn open_without_limit_on_fresh_dir_fails_without_bricking_store() {
        let dir = tempfile::tempdir().unwrap();
        let err = BlobStore::open(dir.path(), None, None, None, None, fake_disk(), None)
            .unwrap_err();
        assert_eq!(err.kind(), "INVAL");

        // A failed create attempt must not leave the create-lock held: a
        // normal create afterwards has to succeed, not hang or see a stale
        // reader/writer mode mismatch.
        let store = BlobStore::open(dir.path(), Some(500), None, None, None, fake_disk(), None)
            .unwrap();
        assert_eq!(store.meta().limit_blocks, 500);
    }

    #[test]
    fn scan_finds_blob_and_in_use_mask() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), Some(1000), None, None, None, fake_disk(), None).unwrap();

        let blocks = sidecar::sidecar_path(store.root(), store.format(), "b1", Suffix::Blocks);
        sidecar::ensure_parent_dir(store.root(), store.format(), "b1").unwrap();
        std::fs::File::create(&blocks).unwrap().set_len(5120).unwrap();

        let records = store.scan().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "b1");
        assert_eq!(records[0].size_blocks, 10);
        assert!(!records[0].in_use.contains(InUseMask::OPENED));

        let handle = locking::acquire(&blocks, AccessMode::ReadWrite, None, 0).unwrap();
        let records = store.scan().unwrap();
        assert!(records[0].in_use.contains(InUseMask::OPENED));
        locking::release(handle).unwrap();
    }
}
