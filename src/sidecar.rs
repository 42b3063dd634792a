//! Typed sidecar file I/O for a single blob (component C2).
//!
//! Every sidecar read or write in the crate funnels through this module so
//! the path-mapping rule (`ROOT/id.<suffix>` or `ROOT/id/<suffix>`) and the
//! "absent file reads back as empty" contract are enforced in exactly one
//! place.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::BlobError;
use crate::tools::file_set_contents;

/// On-disk layout for a store: one file per blob+suffix, or one directory
/// per blob holding a file per suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreFormat {
    Files,
    Directory,
}

/// The six typed sidecar suffixes a blob may have. Any other filename under
/// the store root is ignored by the scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Suffix {
    Blocks,
    Loopback,
    Dm,
    Deps,
    Refs,
    Sig,
}

impl Suffix {
    pub const ALL: [Suffix; 6] = [
        Suffix::Blocks,
        Suffix::Loopback,
        Suffix::Dm,
        Suffix::Deps,
        Suffix::Refs,
        Suffix::Sig,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Suffix::Blocks => "blocks",
            Suffix::Loopback => "loopback",
            Suffix::Dm => "dm",
            Suffix::Deps => "deps",
            Suffix::Refs => "refs",
            Suffix::Sig => "sig",
        }
    }

    fn from_str(s: &str) -> Option<Suffix> {
        Suffix::ALL.iter().copied().find(|suf| suf.as_str() == s)
    }
}

/// Build the on-disk path for `suffix` of blob `id` under `root`, in the
/// given store format. Parent directories are not created here; callers
/// that are about to write use [`ensure_parent_dir`].
pub fn sidecar_path(root: &Path, format: StoreFormat, id: &str, suffix: Suffix) -> PathBuf {
    match format {
        StoreFormat::Files => root.join(format!("{}.{}", id, suffix.as_str())),
        StoreFormat::Directory => root.join(id).join(suffix.as_str()),
    }
}

/// Ensure the directory that will hold `id`'s sidecars exists, mode 0700.
pub fn ensure_parent_dir(root: &Path, format: StoreFormat, id: &str) -> Result<(), BlobError> {
    let dir = match format {
        StoreFormat::Files => {
            let blocks = sidecar_path(root, format, id, Suffix::Blocks);
            blocks
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| root.to_path_buf())
        }
        StoreFormat::Directory => root.join(id),
    };
    std::fs::create_dir_all(&dir).map_err(BlobError::from)?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
        .map_err(BlobError::from)?;
    Ok(())
}

/// Inverse of [`sidecar_path`]: classify a filesystem path (relative to the
/// store root) into its suffix and blob id, or `None` if it is not a
/// recognized sidecar (e.g. `.blobstore`, or a directory entry that is not a
/// typed file).
pub fn classify(root: &Path, format: StoreFormat, path: &Path) -> Option<(Suffix, String)> {
    let rel = path.strip_prefix(root).ok()?;
    match format {
        StoreFormat::Files => {
            let name = rel.to_str()?;
            let (id, suffix) = name.rsplit_once('.')?;
            let suffix = Suffix::from_str(suffix)?;
            Some((suffix, id.to_string()))
        }
        StoreFormat::Directory => {
            let suffix_str = rel.file_name()?.to_str()?;
            let suffix = Suffix::from_str(suffix_str)?;
            let id = rel.parent()?.to_str()?;
            Some((suffix, id.to_string()))
        }
    }
}

/// Read the full contents of `suffix` for blob `id`, failing `NOENT` if the
/// file is absent.
pub fn read_string(root: &Path, format: StoreFormat, id: &str, suffix: Suffix) -> Result<String, BlobError> {
    let path = sidecar_path(root, format, id, suffix);
    std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BlobError::noent(format!("{:?} not found", path))
        } else {
            BlobError::from(e)
        }
    })
}

/// Write `s` as the full contents of `suffix` for blob `id`. Writing an
/// empty string unlinks the file instead of leaving a zero-byte one behind.
pub fn write_string(
    root: &Path,
    format: StoreFormat,
    id: &str,
    suffix: Suffix,
    s: &str,
) -> Result<(), BlobError> {
    let path = sidecar_path(root, format, id, suffix);
    if s.is_empty() {
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::from(e)),
        }
    } else {
        ensure_parent_dir(root, format, id)?;
        file_set_contents(&path, s.as_bytes())
    }
}

/// Read `suffix` as a list of non-empty lines. An absent file yields an
/// empty list, never an error.
pub fn read_lines(root: &Path, format: StoreFormat, id: &str, suffix: Suffix) -> Result<Vec<String>, BlobError> {
    match read_string(root, format, id, suffix) {
        Ok(s) => Ok(s.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect()),
        Err(BlobError::NoEnt(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Write `lines` as `suffix`'s content, one per line. An empty slice
/// produces an absent/empty file (via [`write_string`]'s unlink-on-empty
/// rule).
pub fn write_lines(
    root: &Path,
    format: StoreFormat,
    id: &str,
    suffix: Suffix,
    lines: &[String],
) -> Result<(), BlobError> {
    let mut body = String::new();
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }
    write_string(root, format, id, suffix, &body)
}

/// Add (`remove = false`) or remove (`remove = true`) `entry` from
/// `suffix`'s line list, rewriting only if the desired state doesn't
/// already hold. Idempotent: calling twice with the same arguments has the
/// same effect as calling once.
pub fn update_entry(
    root: &Path,
    format: StoreFormat,
    id: &str,
    suffix: Suffix,
    entry: &str,
    remove: bool,
) -> Result<(), BlobError> {
    let mut lines = read_lines(root, format, id, suffix)?;
    let present = lines.iter().any(|l| l == entry);

    if remove {
        if !present {
            return Ok(());
        }
        lines.retain(|l| l != entry);
    } else {
        if present {
            return Ok(());
        }
        lines.push(entry.to_string());
    }

    write_lines(root, format, id, suffix, &lines)
}

/// Format a `refs`/`deps` entry: `"<store_root_path> <blob_id>"`.
pub fn format_ref_entry(store_path: &Path, blob_id: &str) -> String {
    format!("{} {}", store_path.display(), blob_id)
}

/// Parse a `refs`/`deps` entry back into `(store_path, blob_id)`.
pub fn parse_ref_entry(entry: &str) -> Option<(PathBuf, String)> {
    let (path, id) = entry.rsplit_once(' ')?;
    Some((PathBuf::from(path), id.to_string()))
}
