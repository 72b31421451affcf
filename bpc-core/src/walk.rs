//! Directory traversal primitives (`DirOps::dirRead`/`find`).
//!
//! Kept as a small trait so `DEL`/`MRG`/`MIG` can be driven by an in-memory fake in tests
//! instead of a real filesystem. The skip predicate in [`is_bookkeeping`] keeps `refCnt/` and
//! `inode/` out of payload accounting.

use std::io;
use std::path::Path;

/// Names reserved for bookkeeping, never payload.
pub fn is_bookkeeping(raw_name: &str) -> bool {
	matches!(raw_name, "refCnt" | "inode") || raw_name.starts_with("attrib_")
}

/// A physical directory entry as seen by the walker.
#[derive(Debug, Clone)]
pub struct DirEntry {
	/// The raw on-disk name (still mangled, for V3 trees).
	pub raw_name: String,
	pub is_dir: bool,
}

/// Abstraction over directory listing, so the engine can run against a fake tree in tests.
pub trait DirWalk {
	/// Lists the immediate children of `path`, excluding bookkeeping entries.
	fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
}

/// Real filesystem implementation.
pub struct StdDirWalk;

impl DirWalk for StdDirWalk {
	fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
		let mut out = Vec::new();
		let rd = match std::fs::read_dir(path) {
			Ok(rd) => rd,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
			Err(e) => return Err(e),
		};
		for entry in rd {
			let entry = entry?;
			let raw_name = entry.file_name().to_string_lossy().into_owned();
			if is_bookkeeping(&raw_name) {
				continue;
			}
			let file_type = entry.file_type()?;
			out.push(DirEntry {
				raw_name,
				is_dir: file_type.is_dir(),
			});
		}
		Ok(out)
	}
}

#[cfg(test)]
pub mod fake {
	use super::*;
	use std::collections::HashMap;

	/// An in-memory directory tree, keyed by path string, for tests that do not need real
	/// filesystem content.
	#[derive(Default)]
	pub struct FakeDirWalk {
		pub dirs: HashMap<String, Vec<DirEntry>>,
	}

	impl DirWalk for FakeDirWalk {
		fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
			Ok(self
				.dirs
				.get(&path.to_string_lossy().into_owned())
				.cloned()
				.unwrap_or_default())
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn bookkeeping_names_recognized() {
		assert!(is_bookkeeping("refCnt"));
		assert!(is_bookkeeping("inode"));
		assert!(is_bookkeeping("attrib_abcdef"));
		assert!(!is_bookkeeping("fhello.txt"));
	}
}
