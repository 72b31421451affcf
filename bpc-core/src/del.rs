//! Deletion Engine (DEL): walk a backup sub-tree, decrement references, remove
//! files and directories. Cooperates with [`crate::mrg`] when the target backup has a merge
//! candidate and the whole backup (not just a share/path) is being removed.

use crate::ac::AttribContainerStore;
use crate::backups::BackupList;
use crate::drc::DeltaJournal;
use crate::engine::EngineState;
use crate::error::{BpcError, BpcResult};
use crate::mangle::elt_mangle;
use crate::mrg;
use crate::model::AttributeRecord;
use crate::sentinel::{clear_if_clean, Sentinel};
use bpcutil::util::{get_timestamp, ByteSize};
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// What to remove. Only a whole-backup delete ever considers folding into a predecessor —
/// a share-scoped delete stays delete-only even when a valid merge candidate exists, since
/// merging only makes sense when the backup itself is going away.
pub enum DeleteScope {
	WholeBackup,
	Share { share: String, paths: Vec<String> },
}

pub struct DeleteRequest {
	pub host: String,
	pub backup_num: u32,
	pub scope: DeleteScope,
	/// `-f`: delete even though `keep` is set.
	pub force_keep: bool,
	/// `-l`: retain `XferLOG*`/`SmbLOG*` on a whole-backup delete.
	pub keep_logs: bool,
	/// Policy flag mirroring `Config::ref_cnt_fsck`: when `true`, sentinels are never
	/// opportunistically cleared.
	pub ref_cnt_fsck: bool,
}

#[derive(Debug)]
pub struct DeleteOutcome {
	pub merged: bool,
	pub errors: u32,
}

/// Runs one deletion request to completion against the on-disk tree rooted at `top_dir`.
pub fn run_delete(top_dir: &Path, req: &DeleteRequest, state: &mut EngineState) -> BpcResult<DeleteOutcome> {
	let start = get_timestamp();
	let host_dir = top_dir.join("pc").join(&req.host);
	let mut list = BackupList::load(&host_dir).map_err(|e| BpcError::Io(host_dir.clone(), e))?;
	let target = list
		.find(req.backup_num)
		.cloned()
		.ok_or_else(|| BpcError::BackupNotFound(req.backup_num, req.host.clone()))?;

	if target.keep && !req.force_keep {
		return Err(BpcError::KeepSet(req.backup_num));
	}

	let del_dir = host_dir.join(req.backup_num.to_string());
	let whole_backup = matches!(req.scope, DeleteScope::WholeBackup);
	let merge_candidate = if whole_backup {
		list.merge_candidate(req.backup_num).cloned()
	} else {
		None
	};

	state.progress.pid_start();
	Sentinel::NeedFsckDel
		.create(&del_dir)
		.map_err(|e| BpcError::Io(del_dir.clone(), e))?;

	let mut merge_dir = None;
	if let Some(candidate) = &merge_candidate {
		let m_dir = host_dir.join(candidate.num.to_string());
		Sentinel::NeedFsckDel
			.create(&m_dir)
			.map_err(|e| BpcError::Io(m_dir.clone(), e))?;
		if candidate.compress != target.compress {
			state.progress.pid_end();
			return Err(BpcError::CompressionMismatch(req.backup_num, candidate.num));
		}
		merge_dir = Some(m_dir);
	}

	let del_journal = Rc::new(RefCell::new(DeltaJournal::new()));
	let mut del_ac = AttribContainerStore::new(target.compress, del_dir.join("inode"));
	del_ac.set_delta_sink(del_journal.clone());
	del_ac.set_legacy_read_only(state.legacy_read_only);

	let merged = match (&req.scope, &merge_dir) {
		(DeleteScope::WholeBackup, Some(m_dir)) => {
			let candidate = merge_candidate.as_ref().unwrap();
			let merge_journal = Rc::new(RefCell::new(DeltaJournal::new()));
			let mut merge_ac = AttribContainerStore::new(candidate.compress, m_dir.join("inode"));
			merge_ac.set_delta_sink(merge_journal.clone());
			merge_ac.set_legacy_read_only(state.legacy_read_only);

			mrg::merge_tree(&mut del_ac, &mut merge_ac, &del_dir, m_dir, target.no_fill, state)?;
			delete_dir_subtree(&mut del_ac, &del_dir, state);

			del_ac.flush(false).map_err(|e| BpcError::Io(del_dir.clone(), e))?;
			merge_ac.flush(false).map_err(|e| BpcError::Io(m_dir.clone(), e))?;
			state.errors += merge_ac.read_errors;

			if let Some(c) = list.find_mut(candidate.num) {
				c.no_fill = target.no_fill;
			}

			merge_journal
				.borrow()
				.flush(m_dir, 0)
				.map_err(|e| BpcError::Io(m_dir.clone(), e))?;
			del_journal
				.borrow()
				.flush(&del_dir, 0)
				.map_err(|e| BpcError::Io(del_dir.clone(), e))?;

			clear_if_clean(Sentinel::NeedFsckDel, m_dir, state.errors, req.ref_cnt_fsck)
				.map_err(|e| BpcError::Io(m_dir.clone(), e))?;
			true
		}
		(DeleteScope::WholeBackup, None) => {
			delete_dir_subtree(&mut del_ac, &del_dir, state);
			del_ac.flush(false).map_err(|e| BpcError::Io(del_dir.clone(), e))?;
			del_journal
				.borrow()
				.flush(&del_dir, 0)
				.map_err(|e| BpcError::Io(del_dir.clone(), e))?;
			false
		}
		(DeleteScope::Share { share, paths }, _) => {
			if paths.is_empty() {
				delete_path(&mut del_ac, &del_dir, share, state);
			} else {
				let mut parent = del_dir.join(elt_mangle(share));
				for p in &paths[..paths.len() - 1] {
					parent = parent.join(elt_mangle(p));
				}
				delete_path(&mut del_ac, &parent, paths.last().unwrap(), state);
			}
			del_ac.flush(false).map_err(|e| BpcError::Io(del_dir.clone(), e))?;
			del_journal
				.borrow()
				.flush(&del_dir, 0)
				.map_err(|e| BpcError::Io(del_dir.clone(), e))?;
			false
		}
	};

	state.errors += del_ac.read_errors;

	if whole_backup {
		if !req.keep_logs {
			remove_logs(&del_dir);
		}
		list.remove(req.backup_num);
	}
	list.save(&host_dir).map_err(|e| BpcError::Io(host_dir.clone(), e))?;

	clear_if_clean(Sentinel::NeedFsckDel, &del_dir, state.errors, req.ref_cnt_fsck)
		.map_err(|e| BpcError::Io(del_dir.clone(), e))?;

	log::info!(
		"backup #{} delete finished in {:?}: {} files, {} dirs, {} freed, {} errors",
		req.backup_num,
		get_timestamp().saturating_sub(start),
		state.file_cnt,
		state.dir_cnt,
		ByteSize(state.byte_cnt),
		state.errors,
	);
	state.progress.pid_end();
	Ok(DeleteOutcome {
		merged,
		errors: state.errors,
	})
}

/// Removes `name` from `parent_dir`'s container, recursing into its sub-tree first when it is a
/// directory (bottom-up walk, path-delete mode).
fn delete_path(ac: &mut AttribContainerStore, parent_dir: &Path, name: &str, state: &mut EngineState) {
	let Some(rec) = ac.get(parent_dir, name) else {
		return;
	};
	if rec.is_dir() {
		let child_dir = parent_dir.join(elt_mangle(name));
		delete_dir_subtree(ac, &child_dir, state);
	} else {
		charge_record(ac, &rec, state);
		state.note_file();
		state.note_bytes(rec.size);
		state.report_progress("deleting");
	}
	ac.delete(parent_dir, name);
}

/// Empties and removes a directory wholesale: every entry, then the container file itself.
pub(crate) fn delete_dir_subtree(ac: &mut AttribContainerStore, dir: &Path, state: &mut EngineState) {
	for rec in ac.entries(dir) {
		if rec.is_dir() {
			let child_dir = dir.join(elt_mangle(&rec.name));
			delete_dir_subtree(ac, &child_dir, state);
		} else {
			charge_record(ac, &rec, state);
			state.note_file();
			state.note_bytes(rec.size);
		}
		ac.delete(dir, &rec.name);
	}
	ac.remove_container(dir);
	let _ = fs::remove_dir(dir);
	state.note_dir();
	state.report_progress("deleting");
}

/// Charges the digest/inode deltas for one non-directory record being removed.
pub(crate) fn charge_record(ac: &mut AttribContainerStore, rec: &AttributeRecord, state: &mut EngineState) {
	if !rec.digest.is_empty() {
		ac.charge(rec.compress, rec.digest, -1);
	}
	if rec.nlinks > 0 {
		match ac.get_inode(rec.inode) {
			Some(mut inode_rec) => {
				if inode_rec.nlinks <= 1 {
					if !inode_rec.digest.is_empty() {
						ac.charge(inode_rec.compress, inode_rec.digest, -1);
					}
					ac.delete_inode(rec.inode);
				} else {
					inode_rec.nlinks -= 1;
					ac.set_inode(rec.inode, inode_rec);
				}
			}
			// A missing inode is logged and skipped, with no
			// compensating delta; reconciliation is left to the external fsck pass.
			None => state.note_error(&format!("{}: {}", rec.name, BpcError::MissingInode(rec.inode))),
		}
	}
}

fn remove_logs(backup_dir: &Path) {
	let Ok(rd) = fs::read_dir(backup_dir) else {
		return;
	};
	for entry in rd.flatten() {
		let name = entry.file_name().to_string_lossy().into_owned();
		if name.starts_with("XferLOG") || name.starts_with("SmbLOG") {
			let _ = fs::remove_file(entry.path());
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::model::{Digest, EntryType};
	use tempfile::tempdir;

	fn meta(num: u32, compress: bool, version: u8, no_fill: bool, keep: bool) -> crate::model::BackupMeta {
		crate::model::BackupMeta {
			num,
			compress,
			version,
			no_fill,
			keep,
			inode_last: 0,
		}
	}

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

	fn set_up_backup(host_dir: &Path, num: u32, file_digest: Digest) {
		let backup_dir = host_dir.join(num.to_string());
		let mut ac = AttribContainerStore::new(false, backup_dir.join("inode"));
		let share_dir = backup_dir.join(elt_mangle("/data"));
		ac.set(&backup_dir, rec("/data", EntryType::Dir, Digest::EMPTY));
		ac.set(&share_dir, rec("file1", EntryType::File, file_digest));
		ac.flush(false).unwrap();
	}

	#[test]
	fn whole_backup_delete_removes_list_entry_and_charges_minus_one() {
		let top = tempdir().unwrap();
		let host_dir = top.path().join("pc").join("h1");
		set_up_backup(&host_dir, 1, Digest([9u8; 16]));
		let list = BackupList {
			backups: vec![meta(1, false, 4, false, false)],
		};
		list.save(&host_dir).unwrap();

		let mut state = EngineState::new(bpcutil::Progress::new(true));
		let req = DeleteRequest {
			host: "h1".to_owned(),
			backup_num: 1,
			scope: DeleteScope::WholeBackup,
			force_keep: false,
			keep_logs: false,
			ref_cnt_fsck: false,
		};
		let outcome = run_delete(top.path(), &req, &mut state).unwrap();
		assert!(!outcome.merged);
		assert_eq!(outcome.errors, 0);

		let list_after = BackupList::load(&host_dir).unwrap();
		assert!(list_after.find(1).is_none());

		// The backup directory itself survives holding only its refCnt journal: the
		// pool-accounting record of what it used to reference must outlive the backup entry.
		let refcnt_dir = host_dir.join("1").join("refCnt");
		let mut saw_minus_one = false;
		for entry in fs::read_dir(&refcnt_dir).unwrap() {
			let path = entry.unwrap().path();
			if path.file_name().unwrap().to_string_lossy().starts_with("refCnt.") {
				let text = fs::read_to_string(&path).unwrap();
				saw_minus_one |= text.lines().any(|l| l.ends_with("\t-1"));
			}
		}
		assert!(saw_minus_one);
		assert!(!Sentinel::NeedFsckDel.exists(&host_dir.join("1")));
	}

	#[test]
	fn keep_flag_refuses_without_override() {
		let top = tempdir().unwrap();
		let host_dir = top.path().join("pc").join("h4");
		set_up_backup(&host_dir, 5, Digest([1u8; 16]));
		let list = BackupList {
			backups: vec![meta(5, false, 4, false, true)],
		};
		list.save(&host_dir).unwrap();

		let mut state = EngineState::new(bpcutil::Progress::new(true));
		let req = DeleteRequest {
			host: "h4".to_owned(),
			backup_num: 5,
			scope: DeleteScope::WholeBackup,
			force_keep: false,
			keep_logs: false,
			ref_cnt_fsck: false,
		};
		let err = run_delete(top.path(), &req, &mut state).unwrap_err();
		assert!(matches!(err, BpcError::KeepSet(5)));
		assert!(!Sentinel::NeedFsckDel.exists(&host_dir.join("5")));
	}

	#[test]
	fn share_scoped_delete_with_merge_candidate_does_not_merge() {
		let top = tempdir().unwrap();
		let host_dir = top.path().join("pc").join("h3");
		set_up_backup(&host_dir, 3, Digest([2u8; 16]));
		set_up_backup(&host_dir, 4, Digest([3u8; 16]));
		let list = BackupList {
			backups: vec![meta(3, false, 4, true, false), meta(4, false, 4, false, false)],
		};
		list.save(&host_dir).unwrap();

		let mut state = EngineState::new(bpcutil::Progress::new(true));
		let req = DeleteRequest {
			host: "h3".to_owned(),
			backup_num: 4,
			scope: DeleteScope::Share {
				share: "/data".to_owned(),
				paths: vec!["file1".to_owned()],
			},
			force_keep: false,
			keep_logs: false,
			ref_cnt_fsck: false,
		};
		let outcome = run_delete(top.path(), &req, &mut state).unwrap();
		assert!(!outcome.merged);

		let list_after = BackupList::load(&host_dir).unwrap();
		assert!(list_after.find(4).is_some());
		assert!(!Sentinel::NeedFsckDel.exists(&host_dir.join("3")));
	}
}
