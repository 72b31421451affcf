//! Placeholder for the external server-mutex acquisition the real server normally holds.
//!
//! The real product asks a long-lived server process for a per-host lock over RPC; this crate
//! has no such server, so `FileLock` stands in with a non-blocking `flock` on a sentinel file
//! under the host's directory. `-m` (deletion) skips acquisition entirely, matching the
//! original's override flag.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// An acquired or bypassed host-scoped lock.
pub trait HostLock {
	/// Releases the lock. Called on drop; exposed for explicit early release.
	fn release(&mut self);
}

/// A real, file-backed exclusive lock over a host's directory.
pub struct FileLock {
	_file: File,
	path: PathBuf,
	held: bool,
}

impl FileLock {
	/// Attempts to acquire the lock non-blocking. Returns `Ok(None)` if already held elsewhere.
	pub fn try_acquire(host_dir: &Path) -> io::Result<Option<Self>> {
		std::fs::create_dir_all(host_dir)?;
		let path = host_dir.join("LOCK");
		let file = OpenOptions::new()
			.create(true)
			.write(true)
			.open(&path)?;
		let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
		if ret != 0 {
			let err = io::Error::last_os_error();
			if err.kind() == io::ErrorKind::WouldBlock {
				return Ok(None);
			}
			return Err(err);
		}
		Ok(Some(Self {
			_file: file,
			path,
			held: true,
		}))
	}

	/// A no-op lock used when `-m`/override flags bypass mutual exclusion.
	pub fn bypassed() -> BypassedLock {
		BypassedLock
	}
}

impl HostLock for FileLock {
	fn release(&mut self) {
		if self.held {
			let _ = unsafe { libc::flock(self._file.as_raw_fd(), libc::LOCK_UN) };
			self.held = false;
		}
	}
}

impl Drop for FileLock {
	fn drop(&mut self) {
		self.release();
	}
}

impl FileLock {
	/// Path to the lock sentinel, exposed for diagnostics.
	pub fn path(&self) -> &Path {
		&self.path
	}
}

/// A lock that was never actually taken (override flag supplied).
pub struct BypassedLock;

impl HostLock for BypassedLock {
	fn release(&mut self) {}
}
