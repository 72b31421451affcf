//! Merge Engine (MRG): fold a backup being deleted into its immediate predecessor,
//! so the predecessor becomes self-sufficient from the perspective of later backups.

use crate::ac::AttribContainerStore;
use crate::del;
use crate::engine::EngineState;
use crate::error::BpcResult;
use crate::mangle::{elt_mangle, elt_unmangle, looks_mangled};
use crate::model::{AttributeRecord, EntryType};
use crate::walk::is_bookkeeping;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Folds the Del sub-tree (rooted at `del_dir`) into the Merge sub-tree (rooted at `merge_dir`).
/// `result_no_fill` is the `noFill` the predecessor adopts from the backup being deleted
/// used here to decide whether `DELETED` markers are
/// meaningless noise to purge once the fold completes (step 4).
pub fn merge_tree(
	del_ac: &mut AttribContainerStore,
	merge_ac: &mut AttribContainerStore,
	del_dir: &Path,
	merge_dir: &Path,
	result_no_fill: bool,
	state: &mut EngineState,
) -> BpcResult<()> {
	fold_dir(del_ac, merge_ac, del_dir, merge_dir, result_no_fill, state)
}

/// Physical subdirectories under `dir` that look like mangled path elements. Used to inject
/// synthetic `DIR` entries for directories present on disk but missing from the container
///
fn physical_subdirs(dir: &Path) -> Vec<String> {
	let mut out = Vec::new();
	let Ok(rd) = fs::read_dir(dir) else {
		return out;
	};
	for entry in rd.flatten() {
		let raw = entry.file_name().to_string_lossy().into_owned();
		if is_bookkeeping(&raw) || !looks_mangled(&raw) {
			continue;
		}
		if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
			if let Some(name) = elt_unmangle(&raw) {
				out.push(name);
			}
		}
	}
	out
}

fn effective_entries(ac: &mut AttribContainerStore, dir: &Path) -> HashMap<String, AttributeRecord> {
	let mut map: HashMap<String, AttributeRecord> =
		ac.entries(dir).into_iter().map(|r| (r.name.clone(), r)).collect();
	for name in physical_subdirs(dir) {
		map.entry(name.clone())
			.or_insert_with(|| AttributeRecord::synthetic_dir(&name, 0o755, 0, 0, 0));
	}
	map
}

fn fold_dir(
	del_ac: &mut AttribContainerStore,
	merge_ac: &mut AttribContainerStore,
	del_dir: &Path,
	merge_dir: &Path,
	result_no_fill: bool,
	state: &mut EngineState,
) -> BpcResult<()> {
	// Step 1: the Del container's own digest is charged when Del is swept away wholesale by
	// `del::delete_dir_subtree` after the fold; nothing to do here but read both sides.
	let del_entries = effective_entries(del_ac, del_dir);
	let merge_entries = effective_entries(merge_ac, merge_dir);

	let mut names: HashSet<String> = HashSet::new();
	names.extend(del_entries.keys().cloned());
	names.extend(merge_entries.keys().cloned());

	for name in names {
		let a_del = del_entries.get(&name);
		let a_merge = merge_entries.get(&name);
		match (a_del, a_merge) {
			(Some(d), Some(m)) if d.is_dir() && m.is_dir() => {
				if m.no_attrib && !d.no_attrib {
					let mut promoted = d.clone();
					promoted.no_attrib = false;
					merge_ac.set(merge_dir, promoted);
				}
				let child_del = del_dir.join(elt_mangle(&name));
				let child_merge = merge_dir.join(elt_mangle(&name));
				fold_dir(del_ac, merge_ac, &child_del, &child_merge, result_no_fill, state)?;
				state.note_dir();
			}
			(Some(d), Some(_)) => {
				// Present in both, not both DIR: Merge wins, Del's copy is dropped.
				if d.is_dir() {
					let child_del = del_dir.join(elt_mangle(&name));
					del::delete_dir_subtree(del_ac, &child_del, state);
				} else {
					del::charge_record(del_ac, d, state);
				}
				del_ac.delete(del_dir, &name);
			}
			(Some(d), None) => adopt_into_merge(del_ac, merge_ac, del_dir, merge_dir, &name, d, state),
			(None, Some(_)) => {
				// Present only in Merge: nothing to do.
			}
			(None, None) => unreachable!("name came from one of the two maps"),
		}
	}

	// Step 4: a merged directory that ends up filled carries no meaning for DELETED markers.
	if !result_no_fill {
		for rec in merge_ac.entries(merge_dir) {
			if rec.kind == EntryType::Deleted {
				merge_ac.delete(merge_dir, &rec.name);
			}
		}
	}

	Ok(())
}

/// "Present only in Del: adopt into Merge".
fn adopt_into_merge(
	del_ac: &mut AttribContainerStore,
	merge_ac: &mut AttribContainerStore,
	del_dir: &Path,
	merge_dir: &Path,
	name: &str,
	d: &AttributeRecord,
	state: &mut EngineState,
) {
	if !d.digest.is_empty() {
		merge_ac.charge(d.compress, d.digest, 1);
		del_ac.charge(d.compress, d.digest, -1);
	}
	if d.nlinks > 0 {
		if merge_ac.get_inode(d.inode).is_none() {
			match del_ac.get_inode(d.inode) {
				Some(inode_rec) => {
					if !inode_rec.digest.is_empty() {
						merge_ac.charge(inode_rec.compress, inode_rec.digest, 1);
					}
					merge_ac.set_inode(d.inode, inode_rec);
				}
				None => state.note_error(&format!("{name}: inode {} missing while adopting into merge", d.inode)),
			}
		}
		match del_ac.get_inode(d.inode) {
			Some(mut inode_rec) => {
				if inode_rec.nlinks <= 1 {
					if !inode_rec.digest.is_empty() {
						del_ac.charge(inode_rec.compress, inode_rec.digest, -1);
					}
					del_ac.delete_inode(d.inode);
				} else {
					inode_rec.nlinks -= 1;
					del_ac.set_inode(d.inode, inode_rec);
				}
			}
			None => state.note_error(&format!("{name}: inode {} missing in del", d.inode)),
		}
	}

	merge_ac.set(merge_dir, d.clone());

	if d.is_dir() {
		let src = del_dir.join(elt_mangle(name));
		let dst = merge_dir.join(elt_mangle(name));
		if src.exists() {
			if let Some(parent) = dst.parent() {
				let _ = fs::create_dir_all(parent);
			}
			match fs::rename(&src, &dst) {
				Ok(()) => copy_inodes(del_ac, merge_ac, &dst, state),
				Err(e) => {
					state.note_error(&format!("rename {} -> {}: {e}", src.display(), dst.display()));
					del::delete_dir_subtree(del_ac, &src, state);
				}
			}
		}
		state.note_dir();
	} else {
		state.note_file();
	}

	del_ac.delete(del_dir, name);
}

/// After a directory is renamed wholesale from Del into Merge, re-emits the inode-transfer
/// deltas for every attribute container within it: `+1` to Merge, `-1` to Del, for both record
/// digests and container digests, plus the same transfer protocol for referenced inodes
/// (mirrors the original `copyInodes` step).
fn copy_inodes(del_ac: &mut AttribContainerStore, merge_ac: &mut AttribContainerStore, dir: &Path, state: &mut EngineState) {
	if let Some(cd) = merge_ac.on_disk_digest(dir) {
		merge_ac.charge(merge_ac.compress(), cd, 1);
		del_ac.charge(del_ac.compress(), cd, -1);
	}
	for rec in merge_ac.entries(dir) {
		if !rec.digest.is_empty() {
			merge_ac.charge(rec.compress, rec.digest, 1);
			del_ac.charge(rec.compress, rec.digest, -1);
		}
		if rec.nlinks > 0 && merge_ac.get_inode(rec.inode).is_none() {
			match del_ac.get_inode(rec.inode) {
				Some(inode_rec) => {
					if !inode_rec.digest.is_empty() {
						merge_ac.charge(inode_rec.compress, inode_rec.digest, 1);
						del_ac.charge(inode_rec.compress, inode_rec.digest, -1);
					}
					merge_ac.set_inode(rec.inode, inode_rec);
					del_ac.delete_inode(rec.inode);
				}
				None => state.note_error(&format!("inode {} missing during copyInodes", rec.inode)),
			}
		}
		if rec.is_dir() {
			let child = dir.join(elt_mangle(&rec.name));
			copy_inodes(del_ac, merge_ac, &child, state);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::drc::DeltaJournal;
	use crate::model::Digest;
	use bpcutil::Progress;
	use std::cell::RefCell;
	use std::rc::Rc;
	use tempfile::tempdir;

	fn rec(name: &str, kind: EntryType, digest: Digest) -> AttributeRecord {
		AttributeRecord {
			name: name.to_owned(),
			kind,
			mode: 0o644,
			uid: 0,
			gid: 0,
			size: 0,
			mtime: 0,
			digest,
			compress: false,
			inode: 0,
			nlinks: 0,
			no_attrib: false,
		}
	}

	#[test]
	fn entry_unique_to_del_is_transferred_to_merge() {
		let top = tempdir().unwrap();
		let del_dir = top.path().join("4");
		let merge_dir = top.path().join("3");

		let del_journal = Rc::new(RefCell::new(DeltaJournal::new()));
		let mut del_ac = AttribContainerStore::new(false, del_dir.join("inode"));
		del_ac.set_delta_sink(del_journal.clone());
		del_ac.set(&del_dir, rec("onlyindel", EntryType::File, Digest([5u8; 16])));
		del_ac.flush(false).unwrap();

		let merge_journal = Rc::new(RefCell::new(DeltaJournal::new()));
		let mut merge_ac = AttribContainerStore::new(false, merge_dir.join("inode"));
		merge_ac.set_delta_sink(merge_journal.clone());

		let mut state = EngineState::new(Progress::new(true));
		merge_tree(&mut del_ac, &mut merge_ac, &del_dir, &merge_dir, false, &mut state).unwrap();

		assert!(merge_ac.get(&merge_dir, "onlyindel").is_some());
		assert!(del_ac.get(&del_dir, "onlyindel").is_none());

		let del_total: i64 = del_journal.borrow().iter().map(|(_, d)| d).sum();
		let merge_total: i64 = merge_journal.borrow().iter().map(|(_, d)| d).sum();
		assert_eq!(del_total + merge_total, 0);
	}

	#[test]
	fn entry_present_in_both_keeps_merge_and_drops_del() {
		let top = tempdir().unwrap();
		let del_dir = top.path().join("4");
		let merge_dir = top.path().join("3");

		let del_journal = Rc::new(RefCell::new(DeltaJournal::new()));
		let mut del_ac = AttribContainerStore::new(false, del_dir.join("inode"));
		del_ac.set_delta_sink(del_journal.clone());
		del_ac.set(&del_dir, rec("shared", EntryType::File, Digest([6u8; 16])));
		del_ac.flush(false).unwrap();

		let merge_journal = Rc::new(RefCell::new(DeltaJournal::new()));
		let mut merge_ac = AttribContainerStore::new(false, merge_dir.join("inode"));
		merge_ac.set_delta_sink(merge_journal.clone());
		merge_ac.set(&merge_dir, rec("shared", EntryType::File, Digest([7u8; 16])));
		merge_ac.flush(false).unwrap();

		let mut state = EngineState::new(Progress::new(true));
		merge_tree(&mut del_ac, &mut merge_ac, &del_dir, &merge_dir, false, &mut state).unwrap();

		let kept = merge_ac.get(&merge_dir, "shared").unwrap();
		assert_eq!(kept.digest, Digest([7u8; 16]));
		assert!(del_ac.get(&del_dir, "shared").is_none());
	}
}
