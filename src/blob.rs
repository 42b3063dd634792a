//! Blob lifecycle: open / create, close, delete (component C5).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::allocator::{self, delete_files};
use crate::clone::{dm_base_name, teardown_dm_names};
use crate::error::{record_first_error, BlobError};
use crate::locking::{self, AccessMode, LockHandle};
use crate::sidecar::{self, Suffix};
use crate::store::{BlobStore, InUseMask};
use crate::tools::random_hex_id;

bitflags::bitflags! {
    pub struct OpenFlags: u32 {
        const CREATE = 0b01;
        const EXCL   = 0b10;
    }
}

/// An open handle to a blob: its backing file, device path, and the DM
/// stack (if any) composed on top of it by [`crate::clone`].
pub struct Blob {
    pub id: String,
    pub size_blocks: u64,
    pub blocks_path: PathBuf,
    pub device_path: PathBuf,
    pub dm_names: Vec<String>,
    pub last_accessed: SystemTime,
    pub last_modified: SystemTime,
    pub(crate) lock_handle: Option<LockHandle>,
}

impl Blob {
    /// Recompute the in-use mask for this blob. `OPENED` is always set: an
    /// open `Blob` holds the blocks writer lock for its whole lifetime.
    pub fn in_use_mask(&self, store: &BlobStore) -> Result<InUseMask, BlobError> {
        let mut mask = InUseMask::OPENED;
        if !sidecar::read_lines(store.root(), store.format(), &self.id, Suffix::Refs)?.is_empty() {
            mask |= InUseMask::MAPPED;
        }
        if !sidecar::read_lines(store.root(), store.format(), &self.id, Suffix::Deps)?.is_empty() {
            mask |= InUseMask::BACKED;
        }
        Ok(mask)
    }
}

/// Blob ids may contain `/` to introduce subdirectories but must otherwise
/// be a restricted, unambiguous character set: `[A-Za-z0-9_.-]` plus `/` as
/// a separator, no `..` path segments, and no leading/trailing `/`. This
/// keeps the sidecar path mapping injective and makes the DM-name collision
/// check below decidable.
pub(crate) fn validate_blob_id(id: &str) -> Result<(), BlobError> {
    if id.is_empty() {
        return Err(BlobError::inval("blob id must not be empty"));
    }
    if id.starts_with('/') || id.ends_with('/') {
        return Err(BlobError::inval("blob id must not start or end with '/'"));
    }
    if id.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(BlobError::inval("blob id must not contain empty or '..' segments"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))
    {
        return Err(BlobError::inval(
            "blob id may only contain [A-Za-z0-9_./-]",
        ));
    }
    Ok(())
}

/// Reject an id whose hyphenated DM name (see §6.3) would collide with an
/// existing blob's, resolving the original design's open question about
/// `/`-containing ids colliding once hyphenated.
fn check_dm_name_collision(store: &BlobStore, id: &str) -> Result<(), BlobError> {
    let candidate = dm_base_name(id);
    for record in store.scan()? {
        if record.id != id && dm_base_name(&record.id) == candidate {
            return Err(BlobError::inval(format!(
                "blob id {:?} hyphenates to the same device-mapper name as existing blob {:?}",
                id, record.id
            )));
        }
    }
    Ok(())
}

struct CreationGuard<'a> {
    store: &'a BlobStore,
    id: String,
    armed: bool,
}

impl<'a> Drop for CreationGuard<'a> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = delete_files(self.store, &self.id) {
                log::error!(
                    "cleanup after failed create of blob {} left sidecars behind: {}",
                    self.id,
                    e
                );
            }
        }
    }
}

impl BlobStore {
    /// Open, or create-and-open, a blob.
    ///
    /// `id` is required unless `flags` contains `CREATE`, in which case a
    /// random 24-hex-char id is generated when absent. `size_blocks` must be
    /// nonzero when creating. The returned [`Blob`] holds an exclusive
    /// writer lock on its `blocks` sidecar for its entire lifetime — every
    /// blob is always opened writer-exclusive, regardless of whether the
    /// caller intends to write.
    pub fn open_blob(
        &self,
        id: Option<&str>,
        size_blocks: u64,
        flags: OpenFlags,
        sig: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Blob, BlobError> {
        if id.is_none() && !flags.contains(OpenFlags::CREATE) {
            return Err(BlobError::inval("id is required unless CREATE is set"));
        }
        if flags.contains(OpenFlags::CREATE) && size_blocks == 0 {
            return Err(BlobError::inval("size_blocks must be nonzero when creating"));
        }
        if size_blocks > self.meta().limit_blocks {
            return Err(BlobError::inval("requested size exceeds the store's limit_blocks"));
        }

        let id = match id {
            Some(i) => {
                validate_blob_id(i)?;
                i.to_string()
            }
            None => random_hex_id(24),
        };

        let store_guard = self.lock(timeout)?;

        if flags.contains(OpenFlags::CREATE) {
            check_dm_name_collision(self, &id)?;
        }

        sidecar::ensure_parent_dir(self.root(), self.format(), &id)?;

        let open_mode = if !flags.contains(OpenFlags::CREATE) {
            AccessMode::ReadWrite
        } else if flags.contains(OpenFlags::EXCL) {
            AccessMode::ReadWriteCreateExcl
        } else {
            AccessMode::ReadWriteCreate
        };

        let blocks_path = sidecar::sidecar_path(self.root(), self.format(), &id, Suffix::Blocks);
        let lock_handle = locking::acquire(&blocks_path, open_mode, timeout, 0o600)?;

        let file_size = std::fs::metadata(&blocks_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let mut creation_guard = CreationGuard {
            store: self,
            id: id.clone(),
            armed: file_size == 0,
        };

        let result = self.open_blob_locked(&id, size_blocks, sig, file_size, &blocks_path, &store_guard);

        match result {
            Ok(mut blob) => {
                blob.lock_handle = Some(lock_handle);
                creation_guard.armed = false;
                Ok(blob)
            }
            Err(e) => {
                let _ = locking::release(lock_handle);
                drop(creation_guard);
                Err(e)
            }
        }
    }

    fn open_blob_locked(
        &self,
        id: &str,
        requested_size_blocks: u64,
        sig: Option<&str>,
        file_size: u64,
        blocks_path: &Path,
        store_guard: &crate::store::StoreLockGuard,
    ) -> Result<Blob, BlobError> {
        let size_blocks;

        if file_size == 0 {
            if requested_size_blocks == 0 {
                return Err(BlobError::inval("size_blocks must be nonzero when creating"));
            }
            allocator::reclaim(self, requested_size_blocks, store_guard)?;

            let f = std::fs::OpenOptions::new()
                .write(true)
                .open(blocks_path)
                .map_err(BlobError::from)?;
            f.set_len(requested_size_blocks * 512).map_err(BlobError::from)?;
            drop(f);

            if let Some(sig) = sig {
                sidecar::write_string(self.root(), self.format(), id, Suffix::Sig, sig)?;
            }
            size_blocks = requested_size_blocks;
        } else {
            let existing_blocks = file_size / 512;
            if requested_size_blocks != 0 && requested_size_blocks != existing_blocks {
                return Err(BlobError::inval(format!(
                    "blob {} has {} blocks, caller requested {}",
                    id, existing_blocks, requested_size_blocks
                )));
            }
            if let Some(sig) = sig {
                let stored = match sidecar::read_string(self.root(), self.format(), id, Suffix::Sig) {
                    Ok(s) => s,
                    Err(BlobError::NoEnt(_)) => String::new(),
                    Err(e) => return Err(e),
                };
                if stored != sig {
                    return Err(BlobError::Signature(format!(
                        "signature mismatch for blob {}",
                        id
                    )));
                }
            }
            size_blocks = existing_blocks;
        }

        let loop_device = self.ensure_loopback(id, blocks_path)?;
        let dm_names = sidecar::read_lines(self.root(), self.format(), id, Suffix::Dm)?;
        let device_path = match dm_names.last() {
            Some(name) => PathBuf::from(format!("/dev/mapper/{}", name)),
            None => loop_device,
        };

        let metadata = std::fs::metadata(blocks_path).map_err(BlobError::from)?;

        Ok(Blob {
            id: id.to_string(),
            size_blocks,
            blocks_path: blocks_path.to_path_buf(),
            device_path,
            dm_names,
            last_accessed: metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            last_modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            lock_handle: None,
        })
    }

    pub(crate) fn ensure_loopback(&self, id: &str, blocks_path: &Path) -> Result<PathBuf, BlobError> {
        match sidecar::read_string(self.root(), self.format(), id, Suffix::Loopback) {
            Ok(dev) => {
                let dev = PathBuf::from(dev.trim());
                if !self.disk.loop_device_is_valid(&dev) {
                    return Err(BlobError::Unknown(format!(
                        "recorded loopback device {:?} for blob {} no longer exists",
                        dev, id
                    )));
                }
                Ok(dev)
            }
            Err(BlobError::NoEnt(_)) => {
                let dev = self.disk.loop_attach(blocks_path)?;
                sidecar::write_string(
                    self.root(),
                    self.format(),
                    id,
                    Suffix::Loopback,
                    &dev.to_string_lossy(),
                )?;
                Ok(dev)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn detach_loopback(&self, id: &str) -> Result<(), BlobError> {
        match sidecar::read_string(self.root(), self.format(), id, Suffix::Loopback) {
            Ok(dev) => {
                self.disk.loop_detach(Path::new(dev.trim()))?;
                sidecar::write_string(self.root(), self.format(), id, Suffix::Loopback, "")
            }
            Err(BlobError::NoEnt(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close a blob handle. Unless it is still mapped or backed, the
    /// loopback device is torn down too; the blocks writer lock is always
    /// released.
    pub fn close_blob(&self, mut blob: Blob) -> Result<(), BlobError> {
        let mask = blob.in_use_mask(self)?;
        let detach_result = if (mask & (InUseMask::MAPPED | InUseMask::BACKED)).is_empty() {
            self.detach_loopback(&blob.id)
        } else {
            Ok(())
        };

        let release_result = match blob.lock_handle.take() {
            Some(handle) => locking::release(handle),
            None => Ok(()),
        };

        detach_result?;
        release_result?;
        Ok(())
    }

    /// Delete a blob. Fails `AGAIN` if any peer still maps or snapshots this
    /// blob (any in-use bit beyond `OPENED|BACKED` belonging to *other*
    /// holders is visible as `MAPPED` here, since this call itself already
    /// holds `OPENED`).
    ///
    /// On any failure up to and including the loopback detach, `blob` is
    /// handed back alongside the error — it is still fully open and usable,
    /// exactly as if `delete_blob` had never been called. Once the blocks
    /// lock is released and the sidecars are gone there is no "blob" left to
    /// hand back, so from that point on the operation cannot fail back to
    /// the caller; residual peer-refs-update failures are recorded via
    /// [`record_first_error`] and logged instead.
    pub fn delete_blob(&self, mut blob: Blob, timeout: Option<Duration>) -> Result<(), (Blob, BlobError)> {
        let store_guard = match self.lock(timeout) {
            Ok(g) => g,
            Err(e) => return Err((blob, e)),
        };
        let id = blob.id.clone();

        let mask = match blob.in_use_mask(self) {
            Ok(m) => m,
            Err(e) => {
                drop(store_guard);
                return Err((blob, e));
            }
        };
        if mask.contains(InUseMask::MAPPED) {
            drop(store_guard);
            return Err((
                blob,
                BlobError::again(format!("blob {} is still referenced by a peer's deps", id)),
            ));
        }

        let _ = crate::error::take_first_error();

        let dm_names = match sidecar::read_lines(self.root(), self.format(), &id, Suffix::Dm) {
            Ok(v) => v,
            Err(e) => {
                drop(store_guard);
                return Err((blob, e));
            }
        };
        for (name, err) in teardown_dm_names(self.disk.as_ref(), &dm_names) {
            log::warn!("failed to remove dm device {} while deleting {}: {}", name, id, err);
            record_first_error(err);
        }

        let deps = match sidecar::read_lines(self.root(), self.format(), &id, Suffix::Deps) {
            Ok(v) => v,
            Err(e) => {
                drop(store_guard);
                return Err((blob, e));
            }
        };
        for entry in deps {
            if let Some((peer_store_path, peer_id)) = sidecar::parse_ref_entry(&entry) {
                if let Err(e) = self.update_peer_refs_on_delete(&peer_store_path, &peer_id, &id) {
                    log::warn!(
                        "failed to update refs on peer {} ({:?}) while deleting {}: {}",
                        peer_id, peer_store_path, id, e
                    );
                    record_first_error(e);
                }
            }
        }

        if let Err(e) = self.detach_loopback(&id) {
            drop(store_guard);
            return Err((blob, e));
        }

        // Past this point the blob's sidecars and lock are gone; there is no
        // handle left to hand back on failure.
        if let Some(handle) = blob.lock_handle.take() {
            if let Err(e) = locking::release(handle) {
                log::error!("failed to release blocks lock while deleting {}: {}", id, e);
                record_first_error(e);
            }
        }

        if let Err(e) = delete_files(self, &id) {
            log::error!("failed to remove sidecars while deleting {}: {}", id, e);
            record_first_error(e);
        }

        drop(store_guard);

        if let Some(first) = crate::error::take_first_error() {
            log::warn!("blob {} deleted with residual cleanup failures: {}", id, first);
        }

        Ok(())
    }

    /// Remove `my_id`'s entry from `peer_id`'s `refs`, detaching the peer's
    /// loopback device if it is now unmapped. `peer_store_path` may name
    /// this very store (the common case: most clones stay within one
    /// store) or a different one, in which case it is opened and locked
    /// independently — never re-entering this store's own lock, which the
    /// caller is still holding.
    fn update_peer_refs_on_delete(
        &self,
        peer_store_path: &Path,
        peer_id: &str,
        my_id: &str,
    ) -> Result<(), BlobError> {
        let my_entry = sidecar::format_ref_entry(self.root(), my_id);
        if peer_store_path == self.root() {
            self.apply_ref_removal(peer_id, &my_entry)
        } else {
            let peer = BlobStore::open(
                peer_store_path,
                None,
                None,
                None,
                None,
                self.disk.clone(),
                Some(Duration::from_secs(30)),
            )?;
            let peer_guard = peer.lock(Some(Duration::from_secs(30)))?;
            let result = peer.apply_ref_removal(peer_id, &my_entry);
            drop(peer_guard);
            result
        }
    }

    fn apply_ref_removal(&self, peer_id: &str, my_entry: &str) -> Result<(), BlobError> {
        sidecar::update_entry(self.root(), self.format(), peer_id, Suffix::Refs, my_entry, true)?;
        let still_mapped = !sidecar::read_lines(self.root(), self.format(), peer_id, Suffix::Refs)?.is_empty();
        if !still_mapped {
            self.detach_loopback(peer_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskutil::fake::FakeDiskOps;
    use crate::sidecar::StoreFormat;
    use crate::store::SnapshotPolicy;
    use std::sync::Arc;

    fn open_store(dir: &std::path::Path) -> BlobStore {
        BlobStore::open(
            dir,
            Some(1000),
            Some(StoreFormat::Files),
            Some(crate::store::RevocationPolicy::None),
            Some(SnapshotPolicy::Dm),
            Arc::new(FakeDiskOps::new()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn create_close_open_close_delete_leaves_no_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let blob = store
            .open_blob(Some("b1"), 10, OpenFlags::CREATE, None, None)
            .unwrap();
        assert_eq!(blob.size_blocks, 10);
        store.close_blob(blob).unwrap();

        let blob = store.open_blob(Some("b1"), 0, OpenFlags::empty(), None, None).unwrap();
        store.close_blob(blob).unwrap();

        let blob = store.open_blob(Some("b1"), 0, OpenFlags::empty(), None, None).unwrap();
        store.delete_blob(blob, None).map_err(|(_, e)| e).unwrap();

        let mut remaining = 0;
        for entry in walkdir::WalkDir::new(dir.path()) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() && entry.file_name() != ".blobstore" {
                remaining += 1;
            }
        }
        assert_eq!(remaining, 0);
    }

    #[test]
    fn signature_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let blob = store
            .open_blob(Some("b1"), 10, OpenFlags::CREATE, Some("abc"), None)
            .unwrap();
        store.close_blob(blob).unwrap();

        let blob = store
            .open_blob(Some("b1"), 0, OpenFlags::empty(), Some("abc"), None)
            .unwrap();
        store.close_blob(blob).unwrap();

        let err = store
            .open_blob(Some("b1"), 0, OpenFlags::empty(), Some("xyz"), None)
            .unwrap_err();
        assert_eq!(err.kind(), "SIGNATURE");

        let err = store
            .open_blob(Some("b1"), 11, OpenFlags::empty(), None, None)
            .unwrap_err();
        assert_eq!(err.kind(), "INVAL");
    }

    #[test]
    fn create_without_size_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let err = store
            .open_blob(Some("b1"), 0, OpenFlags::CREATE, None, None)
            .unwrap_err();
        assert_eq!(err.kind(), "INVAL");
    }

    #[test]
    fn open_nonexistent_without_create_fails_noent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let err = store
            .open_blob(Some("nope"), 0, OpenFlags::empty(), None, None)
            .unwrap_err();
        assert_eq!(err.kind(), "NOENT");
    }

    #[test]
    fn blob_id_validation() {
        assert!(validate_blob_id("vm/disk0").is_ok());
        assert!(validate_blob_id("").is_err());
        assert!(validate_blob_id("/leading").is_err());
        assert!(validate_blob_id("trailing/").is_err());
        assert!(validate_blob_id("a/../b").is_err());
        assert!(validate_blob_id("weird name").is_err());
    }
}
