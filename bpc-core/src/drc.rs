//! Delta Refcount Journal: buffer per-backup, per-digest refcount deltas and flush
//! them to `<backup>/refCnt/` in a format the external `refCountUpdate` tool can consume.

use crate::model::Digest;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Key into the journal: a digest under one of the two pools.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct JournalKey {
	pub compress: bool,
	pub digest: Digest,
}

/// Accumulates refcount deltas in memory and flushes them to disk.
#[derive(Default)]
pub struct DeltaJournal {
	deltas: HashMap<JournalKey, i64>,
}

impl DeltaJournal {
	pub fn new() -> Self {
		Self::default()
	}

	/// Accumulates a delta. Empty digests are ignored (no pool entry to charge); negative
	/// counts going below zero are tolerated, reconciliation happens globally via fsck.
	pub fn update(&mut self, compress: bool, digest: Digest, delta: i32) {
		if digest.is_empty() {
			return;
		}
		*self
			.deltas
			.entry(JournalKey { compress, digest })
			.or_insert(0) += delta as i64;
	}

	/// Total number of distinct digests touched so far (used by callers to decide whether a
	/// flush is needed at all).
	pub fn len(&self) -> usize {
		self.deltas.len()
	}

	pub fn is_empty(&self) -> bool {
		self.deltas.is_empty()
	}

	/// Iterates the accumulated deltas, grouped by `(compress, digest)`.
	pub fn iter(&self) -> impl Iterator<Item = (JournalKey, i64)> + '_ {
		self.deltas.iter().map(|(k, v)| (*k, *v))
	}

	/// Serializes the accumulated deltas to a fresh file under `<backup_dir>/refCnt/`, one line
	/// per `(compress, digest)`: `compress\tdigest_hex\tdelta`. Returns the path written.
	///
	/// The journal is left intact after flushing (callers that want to reset it can construct a
	/// fresh `DeltaJournal`); the file name embeds the process id and a monotonically
	/// increasing counter-like timestamp so repeated flushes within one run do not clobber each
	/// other, matching the legacy product's append-only refCnt directory.
	pub fn flush(&self, backup_dir: &Path, seq: u64) -> io::Result<PathBuf> {
		std::fs::create_dir_all(backup_dir.join("refCnt"))?;
		let path = backup_dir.join("refCnt").join(format!("refCnt.{seq}"));
		let mut f = File::create(&path)?;
		for (key, delta) in self.iter() {
			writeln!(
				f,
				"{}\t{}\t{}",
				key.compress as u8,
				key.digest.to_hex(),
				delta
			)?;
		}
		Ok(path)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn empty_digest_ignored() {
		let mut j = DeltaJournal::new();
		j.update(false, Digest::EMPTY, -1);
		assert!(j.is_empty());
	}

	#[test]
	fn accumulates_same_key() {
		let mut j = DeltaJournal::new();
		let d = Digest([1u8; 16]);
		j.update(false, d, 1);
		j.update(false, d, -1);
		j.update(false, d, -1);
		let (_, total) = j.iter().next().unwrap();
		assert_eq!(total, -1);
	}

	#[test]
	fn flush_writes_lines() {
		let dir = tempfile::tempdir().unwrap();
		let mut j = DeltaJournal::new();
		j.update(true, Digest([2u8; 16]), -1);
		let path = j.flush(dir.path(), 0).unwrap();
		let text = std::fs::read_to_string(path).unwrap();
		assert!(text.contains("\t-1"));
		assert!(text.starts_with('1'));
	}
}
