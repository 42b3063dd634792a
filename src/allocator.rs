//! Block budget enforcement and LRU revocation (component C4).
//!
//! Called from [`crate::blob`]'s create path while the caller already holds
//! the store-wide writer lock — the [`StoreLockGuard`] parameter exists
//! purely so that precondition is enforced by the type system rather than a
//! runtime check.

use crate::error::BlobError;
use crate::sidecar::{self, Suffix};
use crate::store::{BlobStore, InUseMask, RevocationPolicy, StoreLockGuard};

/// Unlink every sidecar of `id` and prune now-empty parent directories.
/// Used both by the revoker (purging purgeable blobs) and by the blob
/// lifecycle's delete path.
pub fn delete_files(store: &BlobStore, id: &str) -> Result<(), BlobError> {
    for suffix in Suffix::ALL {
        let path = sidecar::sidecar_path(store.root(), store.format(), id, suffix);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BlobError::from(e)),
        }
    }

    // Directory format keeps one directory per blob id; remove it and any
    // now-empty ancestor directories up to (but not including) the store root.
    if store.format() == crate::sidecar::StoreFormat::Directory {
        let dir = store.root().join(id);
        let _ = std::fs::remove_dir(&dir);
    }

    let mut dir = sidecar::sidecar_path(store.root(), store.format(), id, Suffix::Blocks)
        .parent()
        .map(|p| p.to_path_buf());
    while let Some(d) = dir {
        if d == store.root() {
            break;
        }
        match std::fs::remove_dir(&d) {
            Ok(()) => dir = d.parent().map(|p| p.to_path_buf()),
            Err(_) => break, // not empty, or already gone
        }
    }

    Ok(())
}

/// A blob is "purgeable" iff every bit of its in-use mask is `BACKED` or
/// clear — it is neither opened for write nor mapped/snapshotted by a peer.
fn is_purgeable(mask: InUseMask) -> bool {
    (mask & !InUseMask::BACKED).is_empty()
}

/// Ensure `requested` additional blocks are available in `store`, purging
/// least-recently-modified purgeable blobs under the `LRU` policy if
/// necessary. Must be called while holding `_guard` (the store-wide lock).
pub fn reclaim(
    store: &BlobStore,
    requested: u64,
    _guard: &StoreLockGuard,
) -> Result<(), BlobError> {
    let records = store.scan()?;

    let inuse: u64 = records
        .iter()
        .filter(|r| !is_purgeable(r.in_use))
        .map(|r| r.size_blocks)
        .sum();
    let alloc: u64 = records
        .iter()
        .filter(|r| is_purgeable(r.in_use))
        .map(|r| r.size_blocks)
        .sum();

    let limit = store.meta().limit_blocks;
    let used = inuse + alloc;
    let free = limit.saturating_sub(used);

    if free >= requested {
        return Ok(());
    }

    if store.meta().revocation == RevocationPolicy::None || free + alloc < requested {
        return Err(BlobError::nospc(format!(
            "requested {} blocks, only {} free and {} purgeable in a {}-block store",
            requested, free, alloc, limit
        )));
    }

    let mut purgeable: Vec<_> = records.into_iter().filter(|r| is_purgeable(r.in_use)).collect();
    purgeable.sort_by(|a, b| a.last_modified.cmp(&b.last_modified).then_with(|| a.id.cmp(&b.id)));

    let mut reclaimed = 0u64;
    let needed = requested - free;
    for blob in purgeable {
        if reclaimed >= needed {
            break;
        }
        delete_files(store, &blob.id)?;
        reclaimed += blob.size_blocks;
    }

    if reclaimed < needed {
        return Err(BlobError::nospc(
            "could not purge enough purgeable blobs to satisfy the request",
        ));
    }

    Ok(())
}
