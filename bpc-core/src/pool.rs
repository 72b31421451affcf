//! Content-addressed pool: digest computation, path layout (`MD52Path`/`MD52Path_v3`), and the
//! `PoolWrite` collaborator.

use crate::model::Digest;
use md5::{Digest as _, Md5};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Bytes of legacy content hashed by the V3 digest recipe, regardless of file size (§4.5).
pub const V3_DIGEST_WINDOW: usize = 1024 * 1024;

/// Computes the V4 digest: MD5 over the full stream.
pub fn v4_digest_stream<R: Read>(mut r: R) -> io::Result<Digest> {
	let mut hasher = Md5::new();
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = r.read(&mut buf)?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	Ok(Digest(hasher.finalize().into()))
}

/// Computes the V4 digest of an in-memory buffer.
pub fn v4_digest_bytes(data: &[u8]) -> Digest {
	Digest(Md5::digest(data).into())
}

/// Computes the legacy V3 digest: MD5 of the first [`V3_DIGEST_WINDOW`] bytes (or the whole
/// file when shorter). `first_window` must contain at least `min(total_size, V3_DIGEST_WINDOW)`
/// bytes already read from the front of the stream, which migration keeps buffered anyway to
/// avoid a second read pass (§4.5 step 2).
pub fn v3_digest(first_window: &[u8], total_size: u64) -> Digest {
	let take = (total_size as usize).min(V3_DIGEST_WINDOW).min(first_window.len());
	Digest(Md5::digest(&first_window[..take]).into())
}

/// Fan-out path layout for a pool, mirroring the legacy two-level digest sharding used to
/// avoid giant flat directories (e.g. `pool/0/1/0123456789abcdef...`).
pub struct PoolLayout {
	root: PathBuf,
}

impl PoolLayout {
	pub fn new(root: PathBuf) -> Self {
		Self { root }
	}

	/// `MD52Path`: V4 digest → path under this pool root.
	pub fn path_for(&self, digest: &Digest) -> PathBuf {
		let hex = digest.to_hex();
		self.root.join(&hex[0..1]).join(&hex[1..2]).join(hex)
	}

	/// `MD52Path_v3`: legacy digest → the chain of candidate paths `path3`, `path3_0`,
	/// `path3_1`, ... that migration scans looking for a matching physical inode (§4.5 step 2c).
	pub fn path_for_v3_chain(&self, digest: &Digest) -> Vec<PathBuf> {
		let hex = digest.to_hex();
		let dir = self.root.join(&hex[0..1]).join(&hex[1..2]);
		let mut chain = vec![dir.join(&hex)];
		for i in 0u32..10 {
			chain.push(dir.join(format!("{hex}_{i}")));
		}
		chain
	}

	pub fn root(&self) -> &Path {
		&self.root
	}
}

/// Result of a `PoolWrite` stream-in.
#[derive(Debug, Clone, Copy)]
pub struct PoolWriteResult {
	pub already_existed: bool,
	pub digest: Digest,
	pub pool_size: u64,
	pub error_count: u32,
}

/// The `PoolWrite` collaborator: stream content in, get back its digest and whether it was
/// already present.
pub trait PoolWriter {
	fn write_stream(&self, data: &mut dyn Read) -> io::Result<PoolWriteResult>;
}

/// Real pool writer: computes the digest while streaming to a temp file, then links/renames it
/// into place at the digest-derived path, deduping on an existing match.
pub struct FsPoolWriter {
	layout: PoolLayout,
}

impl FsPoolWriter {
	pub fn new(layout: PoolLayout) -> Self {
		Self { layout }
	}
}

impl PoolWriter for FsPoolWriter {
	fn write_stream(&self, data: &mut dyn Read) -> io::Result<PoolWriteResult> {
		let mut buf = Vec::new();
		data.read_to_end(&mut buf)?;
		let digest = v4_digest_bytes(&buf);
		let dest = self.layout.path_for(&digest);
		if dest.exists() {
			return Ok(PoolWriteResult {
				already_existed: true,
				digest,
				pool_size: buf.len() as u64,
				error_count: 0,
			});
		}
		if let Some(parent) = dest.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let tmp = dest.with_extension("tmp");
		std::fs::write(&tmp, &buf)?;
		std::fs::rename(&tmp, &dest)?;
		Ok(PoolWriteResult {
			already_existed: false,
			digest,
			pool_size: buf.len() as u64,
			error_count: 0,
		})
	}
}

#[cfg(test)]
pub mod fake {
	use super::*;
	use std::cell::RefCell;
	use std::collections::HashSet;

	/// A counting fake pool writer for tests that do not need real pool files on disk.
	#[derive(Default)]
	pub struct FakePoolWriter {
		pub seen: RefCell<HashSet<Digest>>,
	}

	impl PoolWriter for FakePoolWriter {
		fn write_stream(&self, data: &mut dyn Read) -> io::Result<PoolWriteResult> {
			let mut buf = Vec::new();
			data.read_to_end(&mut buf)?;
			let digest = v4_digest_bytes(&buf);
			let already_existed = !self.seen.borrow_mut().insert(digest);
			Ok(PoolWriteResult {
				already_existed,
				digest,
				pool_size: buf.len() as u64,
				error_count: 0,
			})
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn v3_digest_whole_file_when_small() {
		let data = b"hello world";
		let d = v3_digest(data, data.len() as u64);
		assert_eq!(d, v4_digest_bytes(data));
	}

	#[test]
	fn v3_digest_window_when_large() {
		let mut data = vec![0u8; V3_DIGEST_WINDOW + 100];
		data[V3_DIGEST_WINDOW..].fill(0xffu8);
		let d = v3_digest(&data, data.len() as u64);
		assert_eq!(d, v4_digest_bytes(&data[..V3_DIGEST_WINDOW]));
	}

	#[test]
	fn layout_paths_differ_by_digest() {
		let layout = PoolLayout::new(PathBuf::from("/pool"));
		let a = v4_digest_bytes(b"a");
		let b = v4_digest_bytes(b"b");
		assert_ne!(layout.path_for(&a), layout.path_for(&b));
	}
}
