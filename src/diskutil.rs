//! The disk-utility contract (§6.4): loopback attach/detach, device-mapper
//! create/remove/suspend-resume, and ranged block copy.
//!
//! This is deliberately the thinnest possible seam: the core never parses
//! `losetup`/`dmsetup` output beyond what it needs, and every real operation
//! goes through [`tools::run_command`] the same way the rest of this
//! codebase shells out to `blockdev`/`sgdisk`/`mkfs`. Tests substitute
//! [`FakeDiskOps`] so the clone composer and blob lifecycle can be exercised
//! without root privileges or a live loop/DM stack.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::BlobError;
use crate::tools::run_command;

pub trait DiskOps: Send + Sync {
    fn loop_attach(&self, path: &Path) -> Result<PathBuf, BlobError>;
    fn loop_detach(&self, dev: &Path) -> Result<(), BlobError>;
    /// `true` iff `dev` is still the live loopback device this implementation
    /// attached. Used to re-validate a device path recorded in a `loopback`
    /// sidecar from a previous process lifetime. `SystemDiskOps` delegates to
    /// [`is_block_device`]; `FakeDiskOps` checks its own bookkeeping instead,
    /// since its "devices" are plain files and would never pass a real
    /// `S_ISBLK` check.
    fn loop_device_is_valid(&self, dev: &Path) -> bool;
    fn dm_create(&self, name: &str, table: &str) -> Result<(), BlobError>;
    fn dm_remove(&self, name: &str) -> Result<(), BlobError>;
    fn dm_suspend_resume(&self, name: &str) -> Result<(), BlobError>;
    #[allow(clippy::too_many_arguments)]
    fn dd_range(
        &self,
        src: &Path,
        dst: &Path,
        blocksize: u64,
        count: u64,
        dst_off: u64,
        src_off: u64,
    ) -> Result<(), BlobError>;
}

/// `true` iff `path` exists and is a block device (`S_IFBLK`).
pub fn is_block_device(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => (meta.mode() & libc::S_IFMT) == libc::S_IFBLK,
        Err(_) => false,
    }
}

/// Production [`DiskOps`] backed by `losetup`/`dmsetup`/`dd`.
pub struct SystemDiskOps {
    /// How many times to retry a failing `dmsetup remove` before giving up.
    /// The original implementation hardcoded a single retry; here it is
    /// configurable per the open question in the design notes.
    pub dm_remove_retries: u32,
    pub dm_remove_backoff: Duration,
}

impl Default for SystemDiskOps {
    fn default() -> Self {
        SystemDiskOps {
            dm_remove_retries: 1,
            dm_remove_backoff: Duration::from_micros(100),
        }
    }
}

impl DiskOps for SystemDiskOps {
    fn loop_attach(&self, path: &Path) -> Result<PathBuf, BlobError> {
        let mut command = Command::new("losetup");
        command.args(["--show", "-f"]).arg(path);
        let out = run_command(command)?;
        Ok(PathBuf::from(out.trim()))
    }

    fn loop_detach(&self, dev: &Path) -> Result<(), BlobError> {
        let mut command = Command::new("losetup");
        command.arg("-d").arg(dev);
        run_command(command).map(|_| ())
    }

    fn loop_device_is_valid(&self, dev: &Path) -> bool {
        is_block_device(dev)
    }

    fn dm_create(&self, name: &str, table: &str) -> Result<(), BlobError> {
        use std::io::Write;
        use std::process::Stdio;

        let mut child = Command::new("dmsetup")
            .arg("create")
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BlobError::Unknown(format!("failed to spawn dmsetup create: {}", e)))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(table.as_bytes())
                .map_err(|e| BlobError::Unknown(format!("writing dm table for {}: {}", name, e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| BlobError::Unknown(format!("waiting for dmsetup create: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BlobError::Unknown(format!(
                "dmsetup create {} failed: {}",
                name,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn dm_remove(&self, name: &str) -> Result<(), BlobError> {
        let mut last_err = None;
        for attempt in 0..=self.dm_remove_retries {
            let mut command = Command::new("dmsetup");
            command.arg("remove").arg(name);
            match run_command(command) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < self.dm_remove_retries {
                        std::thread::sleep(self.dm_remove_backoff);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| BlobError::Unknown(format!("dmsetup remove {} failed", name))))
    }

    fn dm_suspend_resume(&self, name: &str) -> Result<(), BlobError> {
        let mut suspend = Command::new("dmsetup");
        suspend.arg("suspend").arg(name);
        run_command(suspend)?;
        let mut resume = Command::new("dmsetup");
        resume.arg("resume").arg(name);
        run_command(resume).map(|_| ())
    }

    fn dd_range(
        &self,
        src: &Path,
        dst: &Path,
        blocksize: u64,
        count: u64,
        dst_off: u64,
        src_off: u64,
    ) -> Result<(), BlobError> {
        let mut command = Command::new("dd");
        command
            .arg(format!("if={}", src.display()))
            .arg(format!("of={}", dst.display()))
            .arg(format!("bs={}", blocksize))
            .arg(format!("count={}", count))
            .arg(format!("seek={}", dst_off))
            .arg(format!("skip={}", src_off))
            .arg("conv=notrunc")
            .arg("status=none");
        run_command(command).map(|_| ())
    }
}

/// In-memory fake used by tests: tracks created loop/DM names and performs
/// `dd_range` as a real byte-range copy between regular files, which is
/// enough to exercise the clone composer's byte-layout invariants without a
/// kernel loop/DM stack.
#[cfg(any(test, feature = "fake-disk"))]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeDiskOps {
        pub created: Mutex<HashSet<String>>,
        pub loop_devices: Mutex<Vec<PathBuf>>,
        pub tables: Mutex<HashMap<String, String>>,
    }

    impl FakeDiskOps {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn created_names(&self) -> Vec<String> {
            let mut v: Vec<_> = self.created.lock().unwrap().iter().cloned().collect();
            v.sort();
            v
        }

        /// The `dmsetup create` table text last passed for `name`, if it was
        /// ever created (kept even after `dm_remove`, so rollback tests can
        /// still inspect what a device was built with).
        pub fn table_for(&self, name: &str) -> Option<String> {
            self.tables.lock().unwrap().get(name).cloned()
        }
    }

    impl DiskOps for FakeDiskOps {
        fn loop_attach(&self, path: &Path) -> Result<PathBuf, BlobError> {
            // Fake loop devices are just the backing file path itself,
            // tagged so callers can tell it's a loop "device".
            let dev = path.with_extension("loop");
            std::fs::copy(path, &dev).ok();
            if !dev.exists() {
                std::fs::File::create(&dev).map_err(BlobError::from)?;
            }
            self.loop_devices.lock().unwrap().push(dev.clone());
            Ok(dev)
        }

        fn loop_detach(&self, dev: &Path) -> Result<(), BlobError> {
            self.loop_devices.lock().unwrap().retain(|d| d != dev);
            let _ = std::fs::remove_file(dev);
            Ok(())
        }

        fn loop_device_is_valid(&self, dev: &Path) -> bool {
            self.loop_devices.lock().unwrap().iter().any(|d| d == dev)
        }

        fn dm_create(&self, name: &str, table: &str) -> Result<(), BlobError> {
            let mut created = self.created.lock().unwrap();
            if !created.insert(name.to_string()) {
                return Err(BlobError::Exist(format!("dm device {} already exists", name)));
            }
            self.tables
                .lock()
                .unwrap()
                .insert(name.to_string(), table.to_string());
            Ok(())
        }

        fn dm_remove(&self, name: &str) -> Result<(), BlobError> {
            let mut created = self.created.lock().unwrap();
            if !created.remove(name) {
                return Err(BlobError::NoEnt(format!("dm device {} does not exist", name)));
            }
            Ok(())
        }

        fn dm_suspend_resume(&self, _name: &str) -> Result<(), BlobError> {
            Ok(())
        }

        fn dd_range(
            &self,
            src: &Path,
            dst: &Path,
            blocksize: u64,
            count: u64,
            dst_off: u64,
            src_off: u64,
        ) -> Result<(), BlobError> {
            use std::fs::OpenOptions;
            use std::io::{Read, Seek, SeekFrom, Write};

            let len = (blocksize * count) as usize;
            let mut src_file = std::fs::File::open(src).map_err(BlobError::from)?;
            src_file
                .seek(SeekFrom::Start(src_off * blocksize))
                .map_err(BlobError::from)?;
            let mut buf = vec![0u8; len];
            src_file.read_exact(&mut buf).map_err(BlobError::from)?;

            let mut dst_file = OpenOptions::new()
                .write(true)
                .open(dst)
                .map_err(BlobError::from)?;
            dst_file
                .seek(SeekFrom::Start(dst_off * blocksize))
                .map_err(BlobError::from)?;
            dst_file.write_all(&buf).map_err(BlobError::from)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_block_device_false_for_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        assert!(!is_block_device(&path));
    }
}
