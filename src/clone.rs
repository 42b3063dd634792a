//! Clone/snapshot composition: turning a block map into a device-mapper
//! table (component C6).
//!
//! A blob's blocks file is always its own storage; `compose` only ever adds
//! a device-mapper stack *on top* of that storage so reads of ranges that
//! were not composed (or that were composed with `COPY`) still see the
//! blob's own bytes. `MAP` and `SNAPSHOT` ranges instead redirect reads (and,
//! for `SNAPSHOT`, copy-on-write) to another blob or raw block device.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::blob::Blob;
use crate::diskutil::is_block_device;
use crate::error::BlobError;
use crate::sidecar::{self, Suffix};
use crate::store::{BlobStore, SnapshotPolicy};

/// The minimum length, in blocks, of a `SNAPSHOT` range. Below this the
/// per-chunk exception-table overhead of a dm-snapshot target dominates any
/// benefit over a plain `COPY`.
pub const MIN_SNAPSHOT_BLOCKS: u64 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// Copy the source bytes into this blob's own storage once, now.
    Copy,
    /// Redirect reads/writes of this range to the source, permanently.
    Map,
    /// Expose the source read-only with copy-on-write into this blob's
    /// storage for the range.
    Snapshot,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// A raw block device outside any store (e.g. another VM's existing disk).
    Device(PathBuf),
    /// A blob, possibly in a different store.
    Blob { store_root: PathBuf, id: String },
    /// Synthetic zero-filled range; only meaningful with `Relation::Copy`.
    Zero,
}

/// One row of a blob's block map: `[start_block, start_block+length_blocks)`
/// relates to `source` starting at `source_offset_blocks` there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub relation: Relation,
    pub source: Source,
    pub start_block: u64,
    pub length_blocks: u64,
    pub source_offset_blocks: u64,
}

/// `euca-<id>` with `/` folded to `-`, since device-mapper names cannot
/// contain `/`. Blob ids are validated at create time so that two distinct
/// ids never fold to the same name (see [`crate::blob::validate_blob_id`]
/// and the collision check alongside it).
pub(crate) fn dm_base_name(id: &str) -> String {
    format!("euca-{}", id.replace('/', "-"))
}

/// The largest power-of-two chunk size (in 512-byte sectors), capped at 16,
/// that evenly divides `length_blocks`. Fixed by §4.6, not a free parameter.
pub fn snapshot_chunk_size(length_blocks: u64) -> u64 {
    let mut chunk = 1u64;
    while chunk * 2 <= 16 && length_blocks % (chunk * 2) == 0 {
        chunk *= 2;
    }
    chunk
}

/// Remove every name in `names`, skipping all but the last occurrence of a
/// repeated name (duplicates happen when the same source is mapped more
/// than once) and removing in reverse order so dependents are torn down
/// before what they depend on. Best-effort: every failure is collected and
/// returned rather than aborting partway through.
pub(crate) fn teardown_dm_names(
    disk: &dyn crate::diskutil::DiskOps,
    names: &[String],
) -> Vec<(String, BlobError)> {
    let mut failures = Vec::new();
    let mut seen = HashSet::new();
    for name in names.iter().rev() {
        if !seen.insert(name.clone()) {
            continue;
        }
        if let Err(e) = disk.dm_remove(name) {
            failures.push((name.clone(), e));
        }
    }
    failures
}

fn validate_entries(store: &BlobStore, blob: &Blob, entries: &[MapEntry]) -> Result<(), BlobError> {
    if entries.is_empty() {
        return Err(BlobError::inval("composing a blob requires at least one map entry"));
    }
    if !blob.dm_names.is_empty() {
        return Err(BlobError::Exist(format!(
            "blob {} already has a composed device-mapper stack",
            blob.id
        )));
    }

    let mut sorted: Vec<&MapEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.start_block);

    let mut cursor = 0u64;
    for entry in &sorted {
        if entry.length_blocks == 0 {
            return Err(BlobError::inval("a map entry's length_blocks must be nonzero"));
        }
        if entry.start_block != cursor {
            return Err(BlobError::inval(format!(
                "map entries must tile [0, size_blocks) with no gaps or overlaps: expected start {}, found {}",
                cursor, entry.start_block
            )));
        }
        if entry.relation != Relation::Copy && store.meta().snapshot != SnapshotPolicy::Dm {
            return Err(BlobError::inval(
                "this store's snapshot policy does not permit MAP/SNAPSHOT relations",
            ));
        }
        if entry.relation == Relation::Snapshot && entry.length_blocks < MIN_SNAPSHOT_BLOCKS {
            return Err(BlobError::inval(format!(
                "a SNAPSHOT range must cover at least {} blocks",
                MIN_SNAPSHOT_BLOCKS
            )));
        }
        if let Source::Device(path) = &entry.source {
            if !is_block_device(path) {
                return Err(BlobError::inval(format!("{:?} is not a block device", path)));
            }
        }
        if let Source::Blob { store_root, id } = &entry.source {
            let size_blocks = source_blob_size_blocks(store, store_root, id)?;
            if entry.source_offset_blocks + entry.length_blocks > size_blocks {
                return Err(BlobError::inval(format!(
                    "source blob {:?} range [{}, {}) exceeds its size of {} blocks",
                    id,
                    entry.source_offset_blocks,
                    entry.source_offset_blocks + entry.length_blocks,
                    size_blocks
                )));
            }
        }
        if entry.source == Source::Zero && entry.relation != Relation::Copy {
            return Err(BlobError::inval("a ZERO source only makes sense with COPY"));
        }
        cursor += entry.length_blocks;
    }

    if cursor != blob.size_blocks {
        return Err(BlobError::inval(format!(
            "map entries cover {} blocks, blob is {} blocks",
            cursor, blob.size_blocks
        )));
    }

    Ok(())
}

/// Size, in 512-byte blocks, of a source blob's backing file — read directly
/// from the `blocks` sidecar rather than requiring the caller to pass an
/// open handle, since a map entry's source may well be a blob this process
/// has never opened (only the destination is required to be open).
fn source_blob_size_blocks(store: &BlobStore, store_root: &Path, id: &str) -> Result<u64, BlobError> {
    let blocks_path = if store_root == store.root() {
        sidecar::sidecar_path(store.root(), store.format(), id, Suffix::Blocks)
    } else {
        let peer = BlobStore::open(store_root, None, None, None, None, store.disk.clone(), Some(Duration::from_secs(30)))?;
        sidecar::sidecar_path(peer.root(), peer.format(), id, Suffix::Blocks)
    };
    let metadata = std::fs::metadata(&blocks_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BlobError::noent(format!("source blob {:?} has no blocks file", id))
        } else {
            BlobError::from(e)
        }
    })?;
    Ok(metadata.len() / 512)
}

fn resolve_source_path(store: &BlobStore, source: &Source) -> Result<PathBuf, BlobError> {
    match source {
        Source::Device(path) => Ok(path.clone()),
        Source::Zero => Err(BlobError::inval("a ZERO source has no device path")),
        Source::Blob { store_root, id } => {
            if store_root == store.root() {
                let blocks_path = sidecar::sidecar_path(store.root(), store.format(), id, Suffix::Blocks);
                store.ensure_loopback(id, &blocks_path)
            } else {
                let peer = BlobStore::open(
                    store_root,
                    None,
                    None,
                    None,
                    None,
                    store.disk.clone(),
                    Some(Duration::from_secs(30)),
                )?;
                let blocks_path = sidecar::sidecar_path(peer.root(), peer.format(), id, Suffix::Blocks);
                peer.ensure_loopback(id, &blocks_path)
            }
        }
    }
}

fn copy_now(store: &BlobStore, blob: &Blob, entry: &MapEntry) -> Result<(), BlobError> {
    use std::io::{Seek, SeekFrom, Write};

    match &entry.source {
        Source::Zero => {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(&blob.blocks_path)
                .map_err(BlobError::from)?;
            f.seek(SeekFrom::Start(entry.start_block * 512))
                .map_err(BlobError::from)?;
            let zeros = vec![0u8; (entry.length_blocks * 512) as usize];
            f.write_all(&zeros).map_err(BlobError::from)?;
            Ok(())
        }
        _ => {
            let src_path = resolve_source_path(store, &entry.source)?;
            store.disk.dd_range(
                &src_path,
                &blob.blocks_path,
                512,
                entry.length_blocks,
                entry.start_block,
                entry.source_offset_blocks,
            )
        }
    }
}

fn rollback(store: &BlobStore, created_names: &[String]) {
    for (name, err) in teardown_dm_names(store.disk.as_ref(), created_names) {
        log::warn!(
            "rollback after failed compose: could not remove dm device {}: {}",
            name, err
        );
    }
}

fn record_dependencies(store: &BlobStore, my_id: &str, entries: &[MapEntry]) -> Result<(), BlobError> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !matches!(entry.relation, Relation::Map | Relation::Snapshot) {
            continue;
        }
        if let Source::Blob { store_root, id } = &entry.source {
            let dep_entry = sidecar::format_ref_entry(store_root, id);
            if !seen.insert(dep_entry.clone()) {
                continue;
            }
            sidecar::update_entry(store.root(), store.format(), my_id, Suffix::Deps, &dep_entry, false)?;
            let my_entry = sidecar::format_ref_entry(store.root(), my_id);
            add_peer_ref(store, store_root, id, &my_entry)?;
        }
    }
    Ok(())
}

fn add_peer_ref(store: &BlobStore, peer_store_path: &Path, peer_id: &str, my_entry: &str) -> Result<(), BlobError> {
    if peer_store_path == store.root() {
        sidecar::update_entry(store.root(), store.format(), peer_id, Suffix::Refs, my_entry, false)
    } else {
        let peer = BlobStore::open(
            peer_store_path,
            None,
            None,
            None,
            None,
            store.disk.clone(),
            Some(Duration::from_secs(30)),
        )?;
        let peer_guard = peer.lock(Some(Duration::from_secs(30)))?;
        let result = sidecar::update_entry(peer.root(), peer.format(), peer_id, Suffix::Refs, my_entry, false);
        drop(peer_guard);
        result
    }
}

/// Compose `blob`'s device-mapper stack from `entries`, which must tile
/// `[0, blob.size_blocks)` exactly once. `COPY` ranges are copied into the
/// blob's own storage immediately; `MAP`/`SNAPSHOT` ranges are wired up as
/// device-mapper targets and recorded in the dependency graph. On any
/// failure, every device-mapper device created so far by this call is torn
/// down before the error is returned — `blob` is left exactly as it was
/// passed in.
pub fn compose(
    store: &BlobStore,
    blob: &mut Blob,
    entries: &[MapEntry],
    timeout: Option<Duration>,
) -> Result<(), BlobError> {
    validate_entries(store, blob, entries)?;
    let store_guard = store.lock(timeout)?;
    let result = compose_locked(store, blob, entries);
    drop(store_guard);
    result
}

fn compose_locked(store: &BlobStore, blob: &mut Blob, entries: &[MapEntry]) -> Result<(), BlobError> {
    for entry in entries.iter().filter(|e| e.relation == Relation::Copy) {
        copy_now(store, blob, entry)?;
    }

    // A map made entirely of COPY entries needs no device-mapper stack at
    // all: the bytes are already in the blob's own storage and its loopback
    // device already exposes them. Only MAP/SNAPSHOT ranges require a
    // combined table redirecting reads elsewhere.
    if entries.iter().all(|e| e.relation == Relation::Copy) {
        return Ok(());
    }

    let dm_base = dm_base_name(&blob.id);
    let mut created_names = Vec::new();
    let mut rows = Vec::new();

    for (idx, entry) in entries.iter().enumerate() {
        let row = match entry.relation {
            Relation::Copy => format!(
                "{} {} linear {} {}",
                entry.start_block,
                entry.length_blocks,
                blob.device_path.display(),
                entry.start_block
            ),
            Relation::Map => {
                let source_dev = match resolve_source_path(store, &entry.source) {
                    Ok(p) => p,
                    Err(e) => {
                        rollback(store, &created_names);
                        return Err(e);
                    }
                };
                format!(
                    "{} {} linear {} {}",
                    entry.start_block, entry.length_blocks, source_dev.display(), entry.source_offset_blocks
                )
            }
            Relation::Snapshot => {
                let source_dev = match resolve_source_path(store, &entry.source) {
                    Ok(p) => p,
                    Err(e) => {
                        rollback(store, &created_names);
                        return Err(e);
                    }
                };

                // The COW exception store must be confined to this entry's
                // own destination range, never the whole blob device — else
                // it overlaps any COPY/MAP regions sharing the same blob.
                let back_name = format!("{}-p{}-back", dm_base, idx);
                let back_table = format!(
                    "0 {} linear {} {}",
                    entry.length_blocks,
                    blob.device_path.display(),
                    entry.start_block
                );
                if let Err(e) = store.disk.dm_create(&back_name, &back_table) {
                    rollback(store, &created_names);
                    return Err(e);
                }
                created_names.push(back_name.clone());

                // A nonzero source offset needs its own linear device: the
                // snapshot target takes a single device argument, it cannot
                // express "start reading this device at block N" itself.
                let snapshot_source = if entry.source_offset_blocks > 0 && entry.source != Source::Zero {
                    let real_name = format!("{}-p{}-real", dm_base, idx);
                    let real_table = format!(
                        "0 {} linear {} {}",
                        entry.length_blocks,
                        source_dev.display(),
                        entry.source_offset_blocks
                    );
                    if let Err(e) = store.disk.dm_create(&real_name, &real_table) {
                        rollback(store, &created_names);
                        return Err(e);
                    }
                    created_names.push(real_name.clone());
                    format!("/dev/mapper/{}", real_name)
                } else {
                    source_dev.display().to_string()
                };

                let snap_name = format!("{}-p{}-snap", dm_base, idx);
                let chunk = snapshot_chunk_size(entry.length_blocks);
                let table = format!(
                    "0 {} snapshot {} /dev/mapper/{} P {}",
                    entry.length_blocks, snapshot_source, back_name, chunk
                );
                if let Err(e) = store.disk.dm_create(&snap_name, &table) {
                    rollback(store, &created_names);
                    return Err(e);
                }
                created_names.push(snap_name.clone());
                format!("{} {} linear /dev/mapper/{} 0", entry.start_block, entry.length_blocks, snap_name)
            }
        };
        rows.push(row);
    }

    let table_body = rows.join("\n");
    if let Err(e) = store.disk.dm_create(&dm_base, &table_body) {
        rollback(store, &created_names);
        return Err(e);
    }
    created_names.push(dm_base.clone());

    if let Err(e) = record_dependencies(store, &blob.id, entries) {
        rollback(store, &created_names);
        return Err(e);
    }

    if let Err(e) = sidecar::write_lines(store.root(), store.format(), &blob.id, Suffix::Dm, &created_names) {
        rollback(store, &created_names);
        return Err(e);
    }

    blob.dm_names = created_names;
    blob.device_path = PathBuf::from(format!("/dev/mapper/{}", dm_base));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::OpenFlags;
    use crate::diskutil::fake::FakeDiskOps;
    use crate::sidecar::StoreFormat;
    use crate::store::RevocationPolicy;
    use std::sync::Arc;

    fn open_store(dir: &std::path::Path) -> BlobStore {
        BlobStore::open(
            dir,
            Some(1000),
            Some(StoreFormat::Files),
            Some(RevocationPolicy::None),
            Some(SnapshotPolicy::Dm),
            Arc::new(FakeDiskOps::new()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn snapshot_chunk_size_follows_spec_formula() {
        assert_eq!(snapshot_chunk_size(32), 16);
        assert_eq!(snapshot_chunk_size(33), 1);
        assert_eq!(snapshot_chunk_size(64), 16);
        assert_eq!(snapshot_chunk_size(16), 16);
        assert_eq!(snapshot_chunk_size(1), 1);
        assert!(snapshot_chunk_size(1_000_000) <= 16);
    }

    #[test]
    fn dm_base_name_folds_slashes() {
        assert_eq!(dm_base_name("vm/disk0"), "euca-vm-disk0");
        assert_eq!(dm_base_name("plain"), "euca-plain");
    }

    #[test]
    fn teardown_dedups_keeping_last_occurrence_reverse_order() {
        let disk = FakeDiskOps::new();
        disk.dm_create("a", "t").unwrap();
        disk.dm_create("b", "t").unwrap();
        let failures = teardown_dm_names(&disk, &["a".to_string(), "b".to_string(), "a".to_string()]);
        assert!(failures.is_empty());
        assert!(disk.created.lock().unwrap().is_empty());
    }

    #[test]
    fn validate_rejects_gap_overlap_and_short_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let blob = store
            .open_blob(Some("b1"), 64, OpenFlags::CREATE, None, None)
            .unwrap();

        let gap = vec![MapEntry {
            relation: Relation::Copy,
            source: Source::Zero,
            start_block: 0,
            length_blocks: 32,
            source_offset_blocks: 0,
        }];
        assert_eq!(
            validate_entries(&store, &blob, &gap).unwrap_err().kind(),
            "INVAL"
        );

        let short_snapshot = vec![MapEntry {
            relation: Relation::Snapshot,
            source: Source::Device(PathBuf::from("/dev/doesnotexist")),
            start_block: 0,
            length_blocks: 64,
            source_offset_blocks: 0,
        }];
        let err = validate_entries(&store, &blob, &short_snapshot).unwrap_err();
        assert_eq!(err.kind(), "INVAL");

        store.close_blob(blob).unwrap();
    }

    #[test]
    fn all_copy_map_builds_no_dm_stack() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut dst = store
            .open_blob(Some("dst"), 32, OpenFlags::CREATE, None, None)
            .unwrap();
        let original_device = dst.device_path.clone();

        let entries = vec![MapEntry {
            relation: Relation::Copy,
            source: Source::Zero,
            start_block: 0,
            length_blocks: 32,
            source_offset_blocks: 0,
        }];
        compose(&store, &mut dst, &entries, None).unwrap();

        assert!(dst.dm_names.is_empty());
        assert_eq!(dst.device_path, original_device);

        store.close_blob(dst).unwrap();
    }

    #[test]
    fn map_relation_also_requires_dm_snapshot_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(
            dir.path(),
            Some(1000),
            Some(StoreFormat::Files),
            Some(RevocationPolicy::None),
            Some(SnapshotPolicy::None),
            Arc::new(FakeDiskOps::new()),
            None,
        )
        .unwrap();

        let src = store
            .open_blob(Some("src"), 16, OpenFlags::CREATE, None, None)
            .unwrap();
        let dst = store
            .open_blob(Some("dst"), 16, OpenFlags::CREATE, None, None)
            .unwrap();

        let entries = vec![MapEntry {
            relation: Relation::Map,
            source: Source::Blob {
                store_root: store.root().to_path_buf(),
                id: "src".to_string(),
            },
            start_block: 0,
            length_blocks: 16,
            source_offset_blocks: 0,
        }];
        let err = validate_entries(&store, &dst, &entries).unwrap_err();
        assert_eq!(err.kind(), "INVAL");

        store.close_blob(dst).unwrap();
        store.close_blob(src).unwrap();
    }

    #[test]
    fn blob_source_range_past_its_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let src = store
            .open_blob(Some("src"), 16, OpenFlags::CREATE, None, None)
            .unwrap();
        let dst = store
            .open_blob(Some("dst"), 32, OpenFlags::CREATE, None, None)
            .unwrap();

        let entries = vec![MapEntry {
            relation: Relation::Map,
            source: Source::Blob {
                store_root: store.root().to_path_buf(),
                id: "src".to_string(),
            },
            start_block: 0,
            length_blocks: 32,
            source_offset_blocks: 0,
        }];
        let err = validate_entries(&store, &dst, &entries).unwrap_err();
        assert_eq!(err.kind(), "INVAL");

        store.close_blob(dst).unwrap();
        store.close_blob(src).unwrap();
    }

    #[test]
    fn copy_and_map_compose_byte_layout_and_dependency_graph() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let src = store
            .open_blob(Some("src"), 16, OpenFlags::CREATE, None, None)
            .unwrap();
        std::fs::write(&src.blocks_path, vec![0xABu8; 16 * 512]).unwrap();

        let mut dst = store
            .open_blob(Some("dst"), 32, OpenFlags::CREATE, None, None)
            .unwrap();

        let entries = vec![
            MapEntry {
                relation: Relation::Copy,
                source: Source::Zero,
                start_block: 0,
                length_blocks: 16,
                source_offset_blocks: 0,
            },
            MapEntry {
                relation: Relation::Map,
                source: Source::Blob {
                    store_root: store.root().to_path_buf(),
                    id: "src".to_string(),
                },
                start_block: 16,
                length_blocks: 16,
                source_offset_blocks: 0,
            },
        ];

        compose(&store, &mut dst, &entries, None).unwrap();
        assert_eq!(dst.dm_names, vec!["euca-dst".to_string()]);

        let deps = sidecar::read_lines(store.root(), store.format(), "dst", Suffix::Deps).unwrap();
        assert_eq!(deps, vec![sidecar::format_ref_entry(store.root(), "src")]);
        let refs = sidecar::read_lines(store.root(), store.format(), "src", Suffix::Refs).unwrap();
        assert_eq!(refs, vec![sidecar::format_ref_entry(store.root(), "dst")]);

        let zeros = std::fs::read(&dst.blocks_path).unwrap();
        assert!(zeros[0..16 * 512].iter().all(|&b| b == 0));

        let (src, err) = store.delete_blob(src, None).unwrap_err();
        assert_eq!(err.kind(), "AGAIN");

        store.close_blob(dst).unwrap();
        store.close_blob(src).unwrap();
    }

    #[test]
    fn snapshot_relation_builds_back_real_snap_devices_confined_to_range() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(FakeDiskOps::new());
        let store = BlobStore::open(
            dir.path(),
            Some(1000),
            Some(StoreFormat::Files),
            Some(RevocationPolicy::None),
            Some(SnapshotPolicy::Dm),
            disk.clone(),
            None,
        )
        .unwrap();

        let src = store
            .open_blob(Some("src"), 32, OpenFlags::CREATE, None, None)
            .unwrap();
        std::fs::write(&src.blocks_path, vec![0xCDu8; 32 * 512]).unwrap();

        let mut dst = store
            .open_blob(Some("dst"), 48, OpenFlags::CREATE, None, None)
            .unwrap();

        // Destination range [16, 32) snapshots source blocks [8, 24).
        let entries = vec![
            MapEntry {
                relation: Relation::Copy,
                source: Source::Zero,
                start_block: 0,
                length_blocks: 16,
                source_offset_blocks: 0,
            },
            MapEntry {
                relation: Relation::Snapshot,
                source: Source::Blob {
                    store_root: store.root().to_path_buf(),
                    id: "src".to_string(),
                },
                start_block: 16,
                length_blocks: 16,
                source_offset_blocks: 8,
            },
        ];

        let dst_original_device = dst.device_path.clone();
        compose(&store, &mut dst, &entries, None).unwrap();

        let back_name = "euca-dst-p1-back".to_string();
        let real_name = "euca-dst-p1-real".to_string();
        let snap_name = "euca-dst-p1-snap".to_string();
        assert_eq!(
            dst.dm_names,
            vec![back_name.clone(), real_name.clone(), snap_name.clone(), "euca-dst".to_string()]
        );

        // The COW exception store is confined to this entry's own
        // destination range on the blob's own device, never the whole blob.
        let back_table = disk.table_for(&back_name).unwrap();
        assert_eq!(
            back_table,
            format!("0 16 linear {} 16", dst_original_device.display())
        );

        // source_offset_blocks=8 needs its own linear device since
        // `snapshot` takes a single origin device argument.
        let real_table = disk.table_for(&real_name).unwrap();
        assert_eq!(
            real_table,
            format!("0 16 linear {} 8", src.device_path.display())
        );

        let snap_table = disk.table_for(&snap_name).unwrap();
        assert_eq!(
            snap_table,
            format!("0 16 snapshot /dev/mapper/{} /dev/mapper/{} P {}", real_name, back_name, snapshot_chunk_size(16))
        );

        let deps = sidecar::read_lines(store.root(), store.format(), "dst", Suffix::Deps).unwrap();
        assert_eq!(deps, vec![sidecar::format_ref_entry(store.root(), "src")]);

        store.close_blob(dst).unwrap();
        store.close_blob(src).unwrap();
    }
}
