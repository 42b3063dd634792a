//! A content-addressed block-blob store for VM disk images.
//!
//! A [`store::BlobStore`] owns a directory tree of fixed-size blobs, each
//! backed by a sparse file and exposed to the rest of the system through a
//! loopback device (or, once [`clone::compose`] has run, through a
//! device-mapper device built on top of it). Every blob carries a set of
//! typed sidecar files recording its loopback device, its device-mapper
//! stack, and its place in the clone/snapshot dependency graph.
//!
//! # Module layout
//!
//! * [`locking`] — the process-global, path-keyed reader/writer lock table
//!   that every other module builds on. Combines a thread-level counter
//!   with an OS `flock(2)` so the same lock is safe both within and across
//!   processes.
//! * [`sidecar`] — typed read/write access to a blob's `blocks`, `loopback`,
//!   `dm`, `deps`, `refs` and `sig` files, and the `Files`/`Directory`
//!   on-disk layout they're stored in.
//! * [`store`] — the store directory itself: its `.blobstore` metadata file
//!   and the recursive scanner that builds an in-use view of every blob.
//! * [`allocator`] — block-budget enforcement and LRU revocation, called
//!   while a blob is being created.
//! * [`blob`] — the blob lifecycle: open (create or reuse), close, delete.
//! * [`clone`] — composing a blob's device-mapper table from a block map of
//!   `COPY`/`MAP`/`SNAPSHOT` relations, and maintaining the resulting
//!   dependency graph.
//! * [`diskutil`] — the seam to `losetup`/`dmsetup`/`dd`; swappable for
//!   tests via the `fake-disk` feature.
//! * [`error`] — the crate's error taxonomy and the thread-local
//!   "first error wins" helper used by best-effort cleanup paths.
//! * [`tools`] — small filesystem and subprocess helpers shared by the rest
//!   of the crate.

pub mod allocator;
pub mod blob;
pub mod clone;
pub mod diskutil;
pub mod error;
pub mod locking;
pub mod sidecar;
pub mod store;
pub mod tools;

pub use blob::{Blob, OpenFlags};
pub use clone::{compose, MapEntry, Relation, Source};
pub use diskutil::DiskOps;
pub use error::{BlobError, BlobResult};
pub use sidecar::StoreFormat;
pub use store::{BlobStore, InUseMask, RevocationPolicy, SnapshotPolicy};

#[cfg(test)]
mod tests {
    use crate::blob::OpenFlags;
    use crate::clone::{self, MapEntry, Relation, Source};
    use crate::diskutil::fake::FakeDiskOps;
    use crate::sidecar::StoreFormat;
    use crate::store::{BlobStore, RevocationPolicy, SnapshotPolicy};
    use std::sync::Arc;

    fn open_store(dir: &std::path::Path) -> BlobStore {
        BlobStore::open(
            dir,
            Some(10_000),
            Some(StoreFormat::Files),
            Some(RevocationPolicy::None),
            Some(SnapshotPolicy::Dm),
            Arc::new(FakeDiskOps::new()),
            None,
        )
        .unwrap()
    }

    /// A parent blob snapshotted by a child cannot be deleted until the
    /// child is; once the child is gone, the parent's `refs` is empty again
    /// and the delete that previously failed `AGAIN` succeeds.
    #[test]
    fn snapshot_then_delete_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let parent = store
            .open_blob(Some("parent"), 64, OpenFlags::CREATE, None, None)
            .unwrap();

        let mut child = store
            .open_blob(Some("child"), 64, OpenFlags::CREATE, None, None)
            .unwrap();

        let entries = vec![MapEntry {
            relation: Relation::Snapshot,
            source: Source::Blob {
                store_root: store.root().to_path_buf(),
                id: "parent".to_string(),
            },
            start_block: 0,
            length_blocks: 64,
            source_offset_blocks: 0,
        }];
        clone::compose(&store, &mut child, &entries, None).unwrap();
        assert_eq!(child.dm_names.len(), 2); // one snapshot aux device, one combined table

        let (parent, err) = store.delete_blob(parent, None).unwrap_err();
        assert_eq!(err.kind(), "AGAIN");

        store.delete_blob(child, None).map_err(|(_, e)| e).unwrap();
        store.delete_blob(parent, None).map_err(|(_, e)| e).unwrap();

        let records = store.scan().unwrap();
        assert!(records.is_empty());
    }

    /// A store created with `RevocationPolicy::Lru` reclaims the
    /// least-recently-modified purgeable blob to make room for a new one,
    /// and never touches a blob that is still open or snapshotted.
    #[test]
    fn lru_store_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(
            dir.path(),
            Some(20),
            Some(StoreFormat::Files),
            Some(RevocationPolicy::Lru),
            Some(SnapshotPolicy::Dm),
            Arc::new(FakeDiskOps::new()),
            None,
        )
        .unwrap();

        let old = store
            .open_blob(Some("old"), 10, OpenFlags::CREATE, None, None)
            .unwrap();
        store.close_blob(old).unwrap();

        let held = store
            .open_blob(Some("held"), 10, OpenFlags::CREATE, None, None)
            .unwrap();

        // No room for a new 10-block blob without purging "old" (held stays open).
        let fresh = store
            .open_blob(Some("fresh"), 10, OpenFlags::CREATE, None, None)
            .unwrap();
        store.close_blob(fresh).unwrap();

        let ids: Vec<_> = store.scan().unwrap().into_iter().map(|r| r.id).collect();
        assert!(!ids.contains(&"old".to_string()));
        assert!(ids.contains(&"held".to_string()));
        assert!(ids.contains(&"fresh".to_string()));

        store.close_blob(held).unwrap();
    }
}
