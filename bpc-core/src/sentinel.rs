//! Crash-safety sentinels: `needFsck.del`, `needFsck.mig`, `noPoolCntOk`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// A sentinel file under `<backup>/refCnt/`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sentinel {
	/// Deletion or merge in progress.
	NeedFsckDel,
	/// Migration in progress.
	NeedFsckMig,
	/// Migration hasn't fully contributed; pool counts are known to be partial.
	NoPoolCntOk,
}

impl Sentinel {
	fn file_name(self) -> &'static str {
		match self {
			Sentinel::NeedFsckDel => "needFsck.del",
			Sentinel::NeedFsckMig => "needFsck.mig",
			Sentinel::NoPoolCntOk => "noPoolCntOk",
		}
	}

	fn path(self, backup_dir: &Path) -> PathBuf {
		backup_dir.join("refCnt").join(self.file_name())
	}

	/// Creates the sentinel, creating `refCnt/` if needed. Must be called before the first
	/// mutating write/rename/unlink of the scope it guards.
	pub fn create(self, backup_dir: &Path) -> io::Result<()> {
		let path = self.path(backup_dir);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		File::create(path)?;
		Ok(())
	}

	/// Removes the sentinel. Only call this after a clean run with zero errors (and, for the
	/// fsck-skip policy, when `Config::ref_cnt_fsck` is `false`); any residual sentinel forces a
	/// full fsck on next boot.
	pub fn remove(self, backup_dir: &Path) -> io::Result<()> {
		let path = self.path(backup_dir);
		match fs::remove_file(path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e),
		}
	}

	/// Whether the sentinel is currently present.
	pub fn exists(self, backup_dir: &Path) -> bool {
		self.path(backup_dir).exists()
	}
}

/// Removes `sentinel` if and only if `errors == 0` and the policy allows skipping fsck
/// (`!ref_cnt_fsck`). Otherwise leaves it in place so a full fsck is forced on next boot.
pub fn clear_if_clean(
	sentinel: Sentinel,
	backup_dir: &Path,
	errors: u32,
	ref_cnt_fsck: bool,
) -> io::Result<()> {
	if errors == 0 && !ref_cnt_fsck {
		sentinel.remove(backup_dir)?;
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn create_remove_round_trip() {
		let dir = tempdir().unwrap();
		Sentinel::NeedFsckDel.create(dir.path()).unwrap();
		assert!(Sentinel::NeedFsckDel.exists(dir.path()));
		Sentinel::NeedFsckDel.remove(dir.path()).unwrap();
		assert!(!Sentinel::NeedFsckDel.exists(dir.path()));
	}

	#[test]
	fn clear_if_clean_leaves_sentinel_on_error() {
		let dir = tempdir().unwrap();
		Sentinel::NeedFsckDel.create(dir.path()).unwrap();
		clear_if_clean(Sentinel::NeedFsckDel, dir.path(), 1, false).unwrap();
		assert!(Sentinel::NeedFsckDel.exists(dir.path()));
	}

	#[test]
	fn clear_if_clean_leaves_sentinel_when_fsck_mandatory() {
		let dir = tempdir().unwrap();
		Sentinel::NeedFsckDel.create(dir.path()).unwrap();
		clear_if_clean(Sentinel::NeedFsckDel, dir.path(), 0, true).unwrap();
		assert!(Sentinel::NeedFsckDel.exists(dir.path()));
	}
}
