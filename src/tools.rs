//! Small filesystem and process helpers shared by the rest of the crate.

use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::process::Command;

use nix::sys::stat;
use nix::unistd;
use rand::Rng;

use crate::error::BlobError;

/// Atomically replace the contents of `path` with `data`.
///
/// Uses `mkstemp` in the target directory followed by `rename`, which is
/// safe across threads and processes: a reader either sees the old file or
/// the fully-written new one, never a partial write.
pub fn file_set_contents<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), BlobError> {
    let path = path.as_ref();

    let mut template = path.as_os_str().to_owned();
    template.push(".tmp_XXXXXX");
    let template = Path::new(&template);

    let (fd, tmp_path) = unistd::mkstemp(template)
        .map_err(|e| BlobError::Unknown(format!("mkstemp {:?} failed: {}", template, e)))?;

    let mode = stat::Mode::from_bits_truncate(0o600);
    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(&tmp_path);
        return Err(BlobError::from(std::io::Error::from(err)));
    }

    let mut file = unsafe { File::from_raw_fd(fd) };
    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(&tmp_path);
        return Err(BlobError::from(err));
    }
    drop(file);

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = unistd::unlink(&tmp_path);
        return Err(BlobError::from(err));
    }

    Ok(())
}

/// Run `command`, returning stdout as a `String` on success and an
/// informative [`BlobError`] (including captured stderr) on non-zero exit or
/// spawn failure. Every disk-utility shell-out goes through this helper, the
/// same way the rest of this codebase funnels external tool invocations
/// through one place.
pub fn run_command(mut command: Command) -> Result<String, BlobError> {
    let output = command
        .output()
        .map_err(|e| BlobError::Unknown(format!("failed to run {:?}: {}", command, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BlobError::Unknown(format!(
            "command {:?} failed with {}: {}",
            command,
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Generate a random lowercase-hex id of `nchars` hex digits (always even).
pub fn random_hex_id(nchars: usize) -> String {
    debug_assert!(nchars % 2 == 0, "hex id length must be even");
    let mut bytes = vec![0u8; nchars / 2];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_id_has_expected_length_and_alphabet() {
        let id = random_hex_id(24);
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn file_set_contents_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar");
        file_set_contents(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        file_set_contents(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
