//! Host Probing Adapters
//!
//! Linux implementations of [`VolumeUtil`] and [`Mounter`].

use crate::domain::{MountTable, Mounter, VolumeMode, VolumeUtil};
use crate::error::{Error, Result};
use procfs::process::MountInfos;
use procfs::FromRead;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// Default location of the mount table
pub const PROC_MOUNTINFO: &str = "/proc/self/mountinfo";

fn probe_error(path: &Path, reason: impl ToString) -> Error {
    Error::HostProbe {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// Volume Util
// =============================================================================

/// Probes directories and block devices through the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxVolumeUtil;

impl VolumeUtil for LinuxVolumeUtil {
    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn volume_mode(&self, path: &Path) -> Result<VolumeMode> {
        // Follows symlinks, so by-id links resolve to their device
        let file_type = fs::metadata(path)?.file_type();
        if file_type.is_dir() {
            Ok(VolumeMode::Filesystem)
        } else if file_type.is_block_device() {
            Ok(VolumeMode::Block)
        } else {
            Err(probe_error(path, "neither a directory nor a block device"))
        }
    }

    fn fs_capacity(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|e| probe_error(path, e))?;
        Ok((stat.blocks() as u64).saturating_mul(stat.fragment_size() as u64))
    }

    fn block_capacity(&self, path: &Path) -> Result<u64> {
        let mut device = File::open(path)?;
        Ok(device.seek(SeekFrom::End(0))?)
    }
}

// =============================================================================
// Mounter
// =============================================================================

/// Reads mount points from a mountinfo file
#[derive(Debug, Clone)]
pub struct ProcMounter {
    path: PathBuf,
}

impl ProcMounter {
    pub fn new() -> Self {
        Self::with_path(PROC_MOUNTINFO)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Mounter for ProcMounter {
    fn mount_table(&self) -> Result<MountTable> {
        let infos: MountInfos = FromRead::from_file(&self.path).map_err(|e| probe_error(&self.path, e))?;
        Ok(MountTable::new(
            infos
                .into_iter()
                .map(|info| info.mount_point.to_string_lossy().into_owned()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
35 22 8:17 / /mnt/disks/vol1 rw,relatime shared:20 - ext4 /dev/sdb1 rw
36 22 8:33 / /mnt/disks/vol3 rw,relatime shared:21 - xfs /dev/sdc1 rw
";

    #[test]
    fn test_proc_mounter_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MOUNTINFO.as_bytes()).unwrap();

        let table = ProcMounter::with_path(file.path()).mount_table().unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.is_mount_point("/mnt/disks/vol1"));
        assert!(!table.is_mount_point("/mnt/disks/vol2"));
        assert!(table.is_mount_point("/mnt/disks/vol3"));
    }

    #[test]
    fn test_proc_mounter_missing_file() {
        let mounter = ProcMounter::with_path("/nonexistent/mountinfo");
        assert!(matches!(mounter.mount_table(), Err(Error::HostProbe { .. })));
    }

    #[test]
    fn test_volume_util_on_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("vol1")).unwrap();
        fs::create_dir(dir.path().join("vol2")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        let util = LinuxVolumeUtil;
        let mut names = util.read_dir(dir.path()).unwrap();
        names.sort();
        assert_eq!(names, vec!["notes.txt", "vol1", "vol2"]);

        assert_eq!(
            util.volume_mode(&dir.path().join("vol1")).unwrap(),
            VolumeMode::Filesystem
        );
        assert!(matches!(
            util.volume_mode(&dir.path().join("notes.txt")),
            Err(Error::HostProbe { .. })
        ));
        assert!(util.fs_capacity(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let util = LinuxVolumeUtil;
        assert!(matches!(
            util.read_dir(Path::new("/nonexistent/discovery/dir")),
            Err(Error::Io(_))
        ));
    }
}
