//! Attribute-Container Store: read/write per-directory attribute containers and
//! per-backup inode tables, wired to a [`DeltaJournal`] via [`AttribContainerStore::set_delta_sink`].

use crate::drc::DeltaJournal;
use crate::error::BpcError;
use crate::model::{AttributeRecord, Digest};
use md5::{Digest as _, Md5};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// In-memory state for one directory's attribute container.
struct AttribContainer {
	/// Keyed by mangled file name for deterministic serialization (invariant 4 depends on the
	/// serialized bytes being a pure function of content, not insertion order).
	entries: BTreeMap<String, AttributeRecord>,
	/// Digest embedded in the current on-disk file name, if the container was read from disk.
	on_disk_digest: Option<Digest>,
	/// Other `attrib_*` files found alongside the current one: stale versions left behind by an
	/// interrupted rewrite. `DEL`/`MRG` charge these a `-1` each when sweeping the directory.
	stale: Vec<(PathBuf, Digest)>,
	dirty: bool,
	/// Set when the on-disk body failed to decode as current-format `bincode` (a pre-release or
	/// corrupt container). Gates the one-way upgrade in [`AttribContainerStore::rewrite_one`].
	legacy_fallback: bool,
}

impl AttribContainer {
	fn empty() -> Self {
		Self {
			entries: BTreeMap::new(),
			on_disk_digest: None,
			stale: Vec::new(),
			dirty: false,
			legacy_fallback: false,
		}
	}

	fn serialize(&self) -> Vec<u8> {
		if self.entries.is_empty() {
			return Vec::new();
		}
		bincode::serialize(&self.entries).expect("attribute container serialization cannot fail")
	}
}

/// Reads the digest embedded in an `attrib_<hex>` (or `inode_<hex>`-shaped) file name.
fn digest_from_file_name(file_name: &str, prefix: &str) -> Option<Digest> {
	file_name.strip_prefix(prefix).and_then(Digest::from_hex)
}

/// Loads the set of candidate container files (`prefix*`) present in `dir`, newest first.
fn list_container_files(dir: &Path, prefix: &str) -> std::io::Result<Vec<(PathBuf, Digest, std::time::SystemTime)>> {
	let mut found = Vec::new();
	let rd = match fs::read_dir(dir) {
		Ok(rd) => rd,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
		Err(e) => return Err(e),
	};
	for entry in rd {
		let entry = entry?;
		let name = entry.file_name().to_string_lossy().into_owned();
		if let Some(digest) = digest_from_file_name(&name, prefix) {
			let mtime = entry
				.metadata()
				.and_then(|m| m.modified())
				.unwrap_or(std::time::SystemTime::UNIX_EPOCH);
			found.push((dir.join(name), digest, mtime));
		}
	}
	found.sort_by(|a, b| b.2.cmp(&a.2));
	Ok(found)
}

fn load_container(dir: &Path, prefix: &str) -> std::io::Result<AttribContainer> {
	let candidates = list_container_files(dir, prefix)?;
	let Some((current_path, digest, _)) = candidates.first().cloned() else {
		return Ok(AttribContainer::empty());
	};
	let stale = candidates[1..]
		.iter()
		.map(|(p, d, _)| (p.clone(), *d))
		.collect();
	let bytes = fs::read(&current_path)?;
	let mut legacy_fallback = false;
	let entries: BTreeMap<String, AttributeRecord> = if bytes.is_empty() {
		BTreeMap::new()
	} else {
		match bincode::deserialize(&bytes) {
			// Legacy/pre-release or corrupt body: treated as an empty container for accounting
			// purposes; the next write upgrades it in place, unless the store is running with
			// legacy_read_only set.
			Err(e) => {
				log::warn!("{}", BpcError::Decode(current_path.clone(), e));
				legacy_fallback = true;
				BTreeMap::new()
			}
			Ok(map) => map,
		}
	};
	Ok(AttribContainer {
		entries,
		on_disk_digest: Some(digest),
		stale,
		dirty: false,
		legacy_fallback,
	})
}

/// Scopes the store to one `(host, backupNum, share, compress)` run.
pub struct AttribContainerStore {
	compress: bool,
	dir_cache: HashMap<PathBuf, AttribContainer>,
	inode_dir: PathBuf,
	delta_sink: Option<Rc<RefCell<DeltaJournal>>>,
	/// Read errors encountered while loading a container; the caller surfaces these into the
	/// run's error counter.
	pub read_errors: u32,
	/// When set, a container recovered via the legacy/corrupt-body fallback is never rewritten in
	/// current format: mutations to it stay in memory only. Lets a caller (or a test) force the
	/// one-way upgrade path by flipping this at runtime instead of needing a separate build.
	legacy_read_only: bool,
}

impl AttribContainerStore {
	/// `inode_dir` is the backup-scoped root under which the (single, whole-backup) inode table
	/// container lives, e.g. `<backup_dir>/inode`.
	pub fn new(compress: bool, inode_dir: PathBuf) -> Self {
		Self {
			compress,
			dir_cache: HashMap::new(),
			inode_dir,
			delta_sink: None,
			read_errors: 0,
			legacy_read_only: false,
		}
	}

	pub fn set_delta_sink(&mut self, sink: Rc<RefCell<DeltaJournal>>) {
		self.delta_sink = Some(sink);
	}

	/// Sets whether legacy/corrupt containers are left untouched on flush instead of being
	/// upgraded to current format. Lets a caller force the one-way upgrade path at runtime
	/// (default `false`) instead of needing a separate build.
	pub fn set_legacy_read_only(&mut self, v: bool) {
		self.legacy_read_only = v;
	}

	fn ensure_loaded(&mut self, dir: &Path) {
		if !self.dir_cache.contains_key(dir) {
			let container = match load_container(dir, "attrib_") {
				Ok(c) => c,
				Err(_) => {
					self.read_errors += 1;
					AttribContainer::empty()
				}
			};
			self.dir_cache.insert(dir.to_path_buf(), container);
		}
	}

	pub fn get(&mut self, dir: &Path, name: &str) -> Option<AttributeRecord> {
		self.ensure_loaded(dir);
		self.dir_cache.get(dir).and_then(|c| c.entries.get(name)).cloned()
	}

	pub fn set(&mut self, dir: &Path, rec: AttributeRecord) {
		self.ensure_loaded(dir);
		let container = self.dir_cache.get_mut(dir).unwrap();
		container.entries.insert(rec.name.clone(), rec);
		container.dirty = true;
	}

	pub fn delete(&mut self, dir: &Path, name: &str) -> bool {
		self.ensure_loaded(dir);
		let container = self.dir_cache.get_mut(dir).unwrap();
		let removed = container.entries.remove(name).is_some();
		if removed {
			container.dirty = true;
		}
		removed
	}

	/// Returns all entries currently known for `dir` (loading it first if necessary).
	pub fn entries(&mut self, dir: &Path) -> Vec<AttributeRecord> {
		self.ensure_loaded(dir);
		self.dir_cache[dir].entries.values().cloned().collect()
	}

	/// Stale `attrib_*` files alongside the current one, with their digests, for the caller to
	/// charge `-1` and unlink.
	pub fn stale_files(&mut self, dir: &Path) -> Vec<(PathBuf, Digest)> {
		self.ensure_loaded(dir);
		self.dir_cache[dir].stale.clone()
	}

	/// The digest of the currently-persisted container at `dir`, if any.
	pub fn on_disk_digest(&mut self, dir: &Path) -> Option<Digest> {
		self.ensure_loaded(dir);
		self.dir_cache[dir].on_disk_digest
	}

	fn charge_rewrite(&self, old: Option<Digest>, new: Option<Digest>) {
		let Some(sink) = &self.delta_sink else { return };
		let mut sink = sink.borrow_mut();
		if let Some(new) = new {
			if Some(new) != old {
				sink.update(self.compress, new, 1);
			}
		}
		if let Some(old) = old {
			if Some(old) != new {
				sink.update(self.compress, old, -1);
			}
		}
	}

	/// Rewrites one directory's container. A no-op (no delta, no
	/// write) when the serialized content is unchanged.
	fn rewrite_one(&mut self, dir: &Path) -> std::io::Result<()> {
		let container = match self.dir_cache.get_mut(dir) {
			Some(c) => c,
			None => return Ok(()),
		};
		if !container.dirty {
			return Ok(());
		}
		if self.legacy_read_only && container.legacy_fallback {
			container.dirty = false;
			return Ok(());
		}
		let bytes = container.serialize();
		let new_digest = if bytes.is_empty() {
			None
		} else {
			Some(Digest(Md5::digest(&bytes).into()))
		};
		let old_digest = container.on_disk_digest;
		if new_digest == old_digest {
			container.dirty = false;
			return Ok(());
		}
		if let Some(new_digest) = new_digest {
			fs::create_dir_all(dir)?;
			fs::write(dir.join(format!("attrib_{}", new_digest.to_hex())), &bytes)?;
		}
		if let Some(old_digest) = old_digest {
			let old_path = dir.join(format!("attrib_{}", old_digest.to_hex()));
			let _ = fs::remove_file(old_path);
		}
		self.charge_rewrite(old_digest, new_digest);
		let container = self.dir_cache.get_mut(dir).unwrap();
		container.on_disk_digest = new_digest;
		container.dirty = false;
		Ok(())
	}

	/// Serializes dirty containers to disk. With `force`, also re-verifies non-dirty ones
	/// (a no-op in practice since their serialization is unchanged, but it keeps `flush(true)`
	/// meaningful as an explicit "everything is consistent on disk" checkpoint).
	pub fn flush(&mut self, force: bool) -> std::io::Result<()> {
		let dirs: Vec<PathBuf> = if force {
			self.dir_cache.keys().cloned().collect()
		} else {
			self.dir_cache
				.iter()
				.filter(|(_, c)| c.dirty)
				.map(|(k, _)| k.clone())
				.collect()
		};
		for dir in dirs {
			self.rewrite_one(&dir)?;
		}
		Ok(())
	}

	// --- Inode table: a single whole-backup container keyed by inode number. ---

	fn inode_key(inode: u64) -> String {
		format!("{inode:020}")
	}

	pub fn get_inode(&mut self, inode: u64) -> Option<AttributeRecord> {
		let dir = self.inode_dir.clone();
		self.get(&dir, &Self::inode_key(inode))
	}

	pub fn set_inode(&mut self, inode: u64, mut rec: AttributeRecord) {
		rec.name = Self::inode_key(inode);
		let dir = self.inode_dir.clone();
		self.set(&dir, rec);
	}

	pub fn delete_inode(&mut self, inode: u64) {
		let dir = self.inode_dir.clone();
		self.delete(&dir, &Self::inode_key(inode));
	}

	/// Whether the directory container at `dir` is empty (used by `DEL`/`MRG` to decide whether
	/// to remove the directory itself once its contents are gone).
	pub fn is_empty(&mut self, dir: &Path) -> bool {
		self.ensure_loaded(dir);
		self.dir_cache[dir].entries.is_empty()
	}

	/// The compression mode this store charges container-level deltas under.
	pub fn compress(&self) -> bool {
		self.compress
	}

	/// Charges a delta directly into the journal, bypassing the rewrite-protocol bookkeeping.
	/// Used by `DEL`/`MRG` for individual record and inode digests, which are
	/// transferred or dropped outside the normal `set`/`flush` lifecycle of a container.
	pub fn charge(&self, compress: bool, digest: Digest, delta: i32) {
		if let Some(sink) = &self.delta_sink {
			sink.borrow_mut().update(compress, digest, delta);
		}
	}

	/// Annihilates a directory's container wholesale: charges `-1` for the current container
	/// digest and every stale file, unlinks them, and drops the directory from the cache. Used
	/// when the directory itself is being removed outright rather than rewritten
	/// "for the container file itself").
	pub fn remove_container(&mut self, dir: &Path) {
		self.ensure_loaded(dir);
		if let Some(container) = self.dir_cache.remove(dir) {
			if let Some(d) = container.on_disk_digest {
				self.charge(self.compress, d, -1);
				let _ = fs::remove_file(dir.join(format!("attrib_{}", d.to_hex())));
			}
			for (path, d) in container.stale {
				self.charge(self.compress, d, -1);
				let _ = fs::remove_file(path);
			}
		}
	}
}
