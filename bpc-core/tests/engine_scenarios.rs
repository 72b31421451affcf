//! End-to-end coverage across `AttribContainerStore`, `del`, `mrg` and `mig` together, driven
//! against real temp-directory trees rather than each module's own unit fixtures.

use bpc_core::ac::AttribContainerStore;
use bpc_core::backups::BackupList;
use bpc_core::del::{run_delete, DeleteRequest, DeleteScope};
use bpc_core::engine::EngineState;
use bpc_core::error::BpcError;
use bpc_core::mangle::elt_mangle;
use bpc_core::mig::{migrate_backup, MigrationRequest};
use bpc_core::model::{AttributeRecord, BackupMeta, Digest, EntryType};
use bpc_core::pool::{FsPoolWriter, PoolLayout};
use bpc_core::sentinel::Sentinel;
use bpc_core::walk::StdDirWalk;
use bpcutil::Progress;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn meta(num: u32, compress: bool, version: u8, no_fill: bool, keep: bool) -> BackupMeta {
	BackupMeta {
		num,
		compress,
		version,
		no_fill,
		keep,
		inode_last: 0,
	}
}

fn file_rec(name: &str, digest: Digest) -> AttributeRecord {
	AttributeRecord {
		name: name.to_owned(),
		kind: EntryType::File,
		mode: 0o644,
		uid: 0,
		gid: 0,
		size: 4,
		mtime: 0,
		digest,
		compress: false,
		inode: 0,
		nlinks: 0,
		no_attrib: false,
	}
}

fn dir_rec(name: &str) -> AttributeRecord {
	let mut r = file_rec(name, Digest::EMPTY);
	r.kind = EntryType::Dir;
	r
}

fn write_share(backup_dir: &Path, share: &str, files: &[(&str, Digest)]) {
	let mut ac = AttribContainerStore::new(false, backup_dir.join("inode"));
	let share_dir = backup_dir.join(elt_mangle(share));
	ac.set(backup_dir, dir_rec(share));
	for (name, digest) in files {
		ac.set(&share_dir, file_rec(name, *digest));
	}
	ac.flush(false).unwrap();
}

#[test]
fn whole_backup_delete_merges_into_no_fill_predecessor_and_inherits_no_fill() {
	let top = tempdir().unwrap();
	let host_dir = top.path().join("pc").join("merge-host");

	// Backup 3 is the no-fill predecessor; it already has "kept.txt".
	write_share(&host_dir.join("3"), "/data", &[("kept.txt", Digest([1u8; 16]))]);
	// Backup 4 is the full, about-to-be-deleted backup; it has its own file plus an overlap.
	write_share(
		&host_dir.join("4"),
		"/data",
		&[("onlyin4.txt", Digest([2u8; 16])), ("kept.txt", Digest([1u8; 16]))],
	);

	let list = BackupList {
		backups: vec![meta(3, false, 4, true, false), meta(4, false, 4, false, false)],
	};
	list.save(&host_dir).unwrap();

	let mut state = EngineState::new(Progress::new(true));
	let req = DeleteRequest {
		host: "merge-host".to_owned(),
		backup_num: 4,
		scope: DeleteScope::WholeBackup,
		force_keep: false,
		keep_logs: false,
		ref_cnt_fsck: false,
	};
	let outcome = run_delete(top.path(), &req, &mut state).unwrap();
	assert!(outcome.merged);
	assert_eq!(outcome.errors, 0);

	let list_after = BackupList::load(&host_dir).unwrap();
	assert!(list_after.find(4).is_none());
	let survivor = list_after.find(3).unwrap();
	// Inherits backup 4's noFill (false), per the merge's adoption rule.
	assert!(!survivor.no_fill);

	// #4's directory survives holding only its refCnt journal; its attribute containers and
	// content are gone, transferred into #3.
	assert!(!Sentinel::NeedFsckDel.exists(&host_dir.join("4")));
	assert!(host_dir.join("4").join("refCnt").exists());

	let mut ac = AttribContainerStore::new(false, host_dir.join("3").join("inode"));
	let share_dir = host_dir.join("3").join(elt_mangle("/data"));
	assert!(ac.get(&share_dir, "onlyin4.txt").is_some());
	assert!(ac.get(&share_dir, "kept.txt").is_some());
}

#[test]
fn compression_mismatch_aborts_merge_and_leaves_both_sentinels() {
	let top = tempdir().unwrap();
	let host_dir = top.path().join("pc").join("mismatch-host");

	write_share(&host_dir.join("3"), "/data", &[("a.txt", Digest([3u8; 16]))]);
	write_share(&host_dir.join("4"), "/data", &[("b.txt", Digest([4u8; 16]))]);

	let list = BackupList {
		// Backup 3 is uncompressed, backup 4 is compressed: merge candidacy exists but the
		// compress flags disagree, so the merge must abort before any content moves.
		backups: vec![meta(3, false, 4, true, false), meta(4, true, 4, false, false)],
	};
	list.save(&host_dir).unwrap();

	let mut state = EngineState::new(Progress::new(true));
	let req = DeleteRequest {
		host: "mismatch-host".to_owned(),
		backup_num: 4,
		scope: DeleteScope::WholeBackup,
		force_keep: false,
		keep_logs: false,
		ref_cnt_fsck: false,
	};
	let err = run_delete(top.path(), &req, &mut state).unwrap_err();
	assert!(matches!(err, BpcError::CompressionMismatch(4, 3)));

	assert!(Sentinel::NeedFsckDel.exists(&host_dir.join("3")));
	assert!(Sentinel::NeedFsckDel.exists(&host_dir.join("4")));

	// Nothing was actually deleted or merged.
	let list_after = BackupList::load(&host_dir).unwrap();
	assert!(list_after.find(3).is_some());
	assert!(list_after.find(4).is_some());
	assert!(host_dir.join("4").exists());
}

#[test]
fn force_keep_overrides_keep_flag() {
	let top = tempdir().unwrap();
	let host_dir = top.path().join("pc").join("keep-host");
	write_share(&host_dir.join("9"), "/data", &[("x.txt", Digest([5u8; 16]))]);
	let list = BackupList {
		backups: vec![meta(9, false, 4, false, true)],
	};
	list.save(&host_dir).unwrap();

	let mut state = EngineState::new(Progress::new(true));
	let req = DeleteRequest {
		host: "keep-host".to_owned(),
		backup_num: 9,
		scope: DeleteScope::WholeBackup,
		force_keep: true,
		keep_logs: false,
		ref_cnt_fsck: false,
	};
	let outcome = run_delete(top.path(), &req, &mut state).unwrap();
	assert_eq!(outcome.errors, 0);
	assert!(BackupList::load(&host_dir).unwrap().find(9).is_none());
}

#[test]
fn share_scoped_delete_clears_its_own_sentinel_on_clean_run() {
	let top = tempdir().unwrap();
	let host_dir = top.path().join("pc").join("scoped-host");
	write_share(
		&host_dir.join("6"),
		"/data",
		&[("keepme.txt", Digest([6u8; 16])), ("dropme.txt", Digest([7u8; 16]))],
	);
	let list = BackupList {
		backups: vec![meta(6, false, 4, false, false)],
	};
	list.save(&host_dir).unwrap();

	let mut state = EngineState::new(Progress::new(true));
	let req = DeleteRequest {
		host: "scoped-host".to_owned(),
		backup_num: 6,
		scope: DeleteScope::Share {
			share: "/data".to_owned(),
			paths: vec!["dropme.txt".to_owned()],
		},
		force_keep: false,
		keep_logs: false,
		ref_cnt_fsck: false,
	};
	let outcome = run_delete(top.path(), &req, &mut state).unwrap();
	assert_eq!(outcome.errors, 0);
	assert!(!Sentinel::NeedFsckDel.exists(&host_dir.join("6")));

	let mut ac = AttribContainerStore::new(false, host_dir.join("6").join("inode"));
	let share_dir = host_dir.join("6").join(elt_mangle("/data"));
	assert!(ac.get(&share_dir, "keepme.txt").is_some());
	assert!(ac.get(&share_dir, "dropme.txt").is_none());

	// Backup itself is untouched in the index: a path delete never removes the backup entry.
	assert!(BackupList::load(&host_dir).unwrap().find(6).is_some());
}

#[test]
fn migrated_backup_can_then_be_deleted() {
	let top = tempdir().unwrap();
	let host_dir = top.path().join("pc").join("mig-host");
	let src = host_dir.join("2");
	fs::create_dir_all(&src).unwrap();
	fs::write(src.join("freadme.txt"), b"pipeline content").unwrap();

	let mut backup = meta(2, false, 3, false, false);
	let mut state = EngineState::new(Progress::new(true));
	let mig_req = MigrationRequest {
		host: "mig-host".to_owned(),
		backup_num: 2,
	};
	let pool_writer = FsPoolWriter::new(PoolLayout::new(top.path().join("pool")));
	let mig_out = migrate_backup(
		top.path(),
		&mig_req,
		&mut backup,
		&StdDirWalk,
		&pool_writer,
		0,
		false,
		false,
		&bpcutil::serverprobe::NoopServerProbe,
		&mut state,
	)
	.unwrap();
	assert_eq!(mig_out.errors, 0);
	assert_eq!(backup.version, 4);

	let list = BackupList {
		backups: vec![backup],
	};
	list.save(&host_dir).unwrap();

	let mut del_state = EngineState::new(Progress::new(true));
	let del_req = DeleteRequest {
		host: "mig-host".to_owned(),
		backup_num: 2,
		scope: DeleteScope::WholeBackup,
		force_keep: false,
		keep_logs: false,
		ref_cnt_fsck: false,
	};
	let del_out = run_delete(top.path(), &del_req, &mut del_state).unwrap();
	assert_eq!(del_out.errors, 0);
	assert!(host_dir.join("2").join("refCnt").exists());
	assert!(BackupList::load(&host_dir).unwrap().find(2).is_none());
}
