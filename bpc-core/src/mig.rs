//! Migration Engine (MIG): convert a legacy V3 backup into the V4 layout, assigning
//! fresh inode numbers and content digests while preserving already-deduplicated pool identity.

use crate::ac::AttribContainerStore;
use crate::drc::DeltaJournal;
use crate::engine::EngineState;
use crate::error::{BpcError, BpcResult};
use crate::mangle::{elt_mangle, elt_unmangle, looks_mangled};
use crate::model::{AttributeRecord, BackupMeta, Digest, EntryType};
use crate::pool::{self, PoolLayout, PoolWriter};
use crate::sentinel::{clear_if_clean, Sentinel};
use crate::walk::DirWalk;
use bpcutil::serverprobe::ServerProbe;
use bpcutil::util::{get_timestamp, ByteSize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;
use std::rc::Rc;

pub struct MigrationRequest {
	pub host: String,
	pub backup_num: u32,
}

#[derive(Debug)]
pub struct MigrationOutcome {
	pub errors: u32,
}

/// Migrates one V3 backup to V4 in place. `host_inode_floor` is the highest `inodeLast` already
/// assigned across the host's backups (the fresh inode counter starts one
/// above the higher of the backup's own `inodeLast` and this host-wide floor).
///
/// Refuses unconditionally while `probe` reports the coordinating server as up. When `dry_run`
/// is set, walks the source tree and accumulates the same counters a real run would, but never
/// touches the pool, never writes an attribute container, and never performs the commit rename —
/// `backup`/the on-disk tree are left exactly as found.
#[allow(clippy::too_many_arguments)]
pub fn migrate_backup(
	top_dir: &Path,
	req: &MigrationRequest,
	backup: &mut BackupMeta,
	walk: &dyn DirWalk,
	pool_writer: &dyn PoolWriter,
	host_inode_floor: u64,
	ref_cnt_fsck: bool,
	dry_run: bool,
	probe: &dyn ServerProbe,
	state: &mut EngineState,
) -> BpcResult<MigrationOutcome> {
	let start = get_timestamp();
	let host_dir = top_dir.join("pc").join(&req.host);
	let src_dir = host_dir.join(req.backup_num.to_string());

	if probe.is_running() {
		return Err(BpcError::ServerRunning);
	}
	if src_dir.join("refCnt").exists() {
		return Err(BpcError::AlreadyMigrated(req.backup_num));
	}
	if backup.version != 3 {
		return Err(BpcError::Other(format!(
			"backup #{} is not a V3 backup",
			req.backup_num
		)));
	}

	if dry_run {
		state.progress.pid_start();
		dry_run_walk(walk, &src_dir, state)?;
		log::info!(
			"backup #{} dry run in {:?}: would migrate {} files, {} dirs, {} content, {} errors (no writes performed)",
			req.backup_num,
			get_timestamp().saturating_sub(start),
			state.file_cnt,
			state.dir_cnt,
			ByteSize(state.byte_cnt),
			state.errors,
		);
		state.progress.pid_end();
		return Ok(MigrationOutcome { errors: state.errors });
	}

	let dest_dir = host_dir.join(format!("{}.v4", req.backup_num));
	let old_dir = host_dir.join(format!("{}.v3old", req.backup_num));

	state.progress.pid_start();
	Sentinel::NeedFsckMig
		.create(&dest_dir)
		.map_err(|e| BpcError::Io(dest_dir.clone(), e))?;
	Sentinel::NoPoolCntOk
		.create(&dest_dir)
		.map_err(|e| BpcError::Io(dest_dir.clone(), e))?;

	let journal = Rc::new(RefCell::new(DeltaJournal::new()));
	let mut dest_ac = AttribContainerStore::new(backup.compress, dest_dir.join("inode"));
	dest_ac.set_delta_sink(journal.clone());
	dest_ac.set_legacy_read_only(state.legacy_read_only);

	let pool_layout = PoolLayout::new(top_dir.join(if backup.compress { "cpool" } else { "pool" }));
	let mut inode2digest: HashMap<u64, Digest> = HashMap::new();
	let mut next_inode = host_inode_floor.max(backup.inode_last) + 1;

	if let Err(e) = migrate_dir(
		walk,
		&pool_layout,
		pool_writer,
		backup.compress,
		&src_dir,
		&mut dest_ac,
		&dest_dir,
		&mut inode2digest,
		&mut next_inode,
		&journal,
		state,
	) {
		state.note_error(&format!("{e}"));
	}

	dest_ac.flush(true).map_err(|e| BpcError::Io(dest_dir.clone(), e))?;
	state.errors += dest_ac.read_errors;
	journal
		.borrow()
		.flush(&dest_dir, 0)
		.map_err(|e| BpcError::Io(dest_dir.clone(), e))?;

	fs::rename(&src_dir, &old_dir).map_err(|e| BpcError::Io(src_dir.clone(), e))?;
	if let Err(e) = fs::rename(&dest_dir, &src_dir) {
		state.note_error(&format!("commit rename failed: {e}"));
		let _ = fs::rename(&old_dir, &src_dir);
		return Err(BpcError::Io(dest_dir.clone(), e));
	}
	let _ = fs::remove_dir_all(&old_dir);

	backup.version = 4;
	backup.inode_last = next_inode.saturating_sub(1);

	clear_if_clean(Sentinel::NeedFsckMig, &src_dir, state.errors, ref_cnt_fsck)
		.map_err(|e| BpcError::Io(src_dir.clone(), e))?;

	log::info!(
		"backup #{} migrated in {:?}: {} files, {} dirs, {} content, {} errors",
		req.backup_num,
		get_timestamp().saturating_sub(start),
		state.file_cnt,
		state.dir_cnt,
		ByteSize(state.byte_cnt),
		state.errors,
	);
	state.progress.pid_end();
	Ok(MigrationOutcome { errors: state.errors })
}

/// Read-only counterpart of [`migrate_dir`]: counts files, directories and bytes without
/// assigning inodes, touching the pool, or writing anything.
fn dry_run_walk(walk: &dyn DirWalk, dir: &Path, state: &mut EngineState) -> BpcResult<()> {
	let entries = walk.read_dir(dir).map_err(|e| BpcError::Io(dir.to_path_buf(), e))?;
	for entry in entries {
		if !looks_mangled(&entry.raw_name) {
			continue;
		}
		if elt_unmangle(&entry.raw_name).is_none() {
			state.note_error(&format!("{}: cannot unmangle {}", dir.display(), entry.raw_name));
			continue;
		}
		let child = dir.join(&entry.raw_name);
		if entry.is_dir {
			state.note_dir();
			state.report_progress("migrating (dry run)");
			dry_run_walk(walk, &child, state)?;
			continue;
		}
		match fs::symlink_metadata(&child) {
			Ok(meta) => state.note_bytes(meta.len()),
			Err(e) => {
				state.note_error(&format!("{}: {e}", child.display()));
				continue;
			}
		}
		state.note_file();
		state.report_progress("migrating (dry run)");
	}
	Ok(())
}

#[allow(clippy::too_many_arguments)]
fn migrate_dir(
	walk: &dyn DirWalk,
	pool_layout: &PoolLayout,
	pool_writer: &dyn PoolWriter,
	compress: bool,
	src_dir: &Path,
	dest_ac: &mut AttribContainerStore,
	dest_dir: &Path,
	inode2digest: &mut HashMap<u64, Digest>,
	next_inode: &mut u64,
	journal: &Rc<RefCell<DeltaJournal>>,
	state: &mut EngineState,
) -> BpcResult<()> {
	let entries = walk
		.read_dir(src_dir)
		.map_err(|e| BpcError::Io(src_dir.to_path_buf(), e))?;

	for entry in entries {
		if !looks_mangled(&entry.raw_name) {
			continue;
		}
		let Some(name) = elt_unmangle(&entry.raw_name) else {
			state.note_error(&format!("{}: cannot unmangle {}", src_dir.display(), entry.raw_name));
			continue;
		};
		let child_src = src_dir.join(&entry.raw_name);

		let mut rec = match stat_record(&child_src, &name) {
			Ok(r) => r,
			Err(e) => {
				state.note_error(&format!("{}: {e}", child_src.display()));
				continue;
			}
		};
		rec.inode = *next_inode;
		*next_inode += 1;
		rec.nlinks = 0;

		if rec.is_dir() {
			let child_dest = dest_dir.join(elt_mangle(&name));
			dest_ac.set(dest_dir, rec.clone());
			state.note_dir();
			state.report_progress("migrating");
			migrate_dir(
				walk,
				pool_layout,
				pool_writer,
				compress,
				&child_src,
				dest_ac,
				&child_dest,
				inode2digest,
				next_inode,
				journal,
				state,
			)?;
			continue;
		}

		if rec.kind.is_content_addressed() {
			match migrate_content(pool_layout, pool_writer, compress, &child_src, rec.kind, inode2digest, journal) {
				Ok(digest) => {
					rec.digest = digest;
					rec.compress = compress;
				}
				Err(e) => state.note_error(&format!("{}: {e}", child_src.display())),
			}
		}
		state.note_bytes(rec.size);
		dest_ac.set(dest_dir, rec);
		state.note_file();
		state.report_progress("migrating");
	}
	dest_ac.flush(false).map_err(|e| BpcError::Io(dest_dir.to_path_buf(), e))?;
	Ok(())
}

/// Reads `stat()`-derivable attributes for a path not found in the (unsupported) legacy
/// container — every record this engine emits is synthesized this way.
fn stat_record(path: &Path, name: &str) -> std::io::Result<AttributeRecord> {
	let meta = fs::symlink_metadata(path)?;
	Ok(AttributeRecord {
		name: name.to_owned(),
		kind: classify(&meta),
		mode: meta.permissions().mode(),
		uid: meta.uid(),
		gid: meta.gid(),
		size: meta.len(),
		mtime: meta.mtime(),
		digest: Digest::EMPTY,
		compress: false,
		inode: 0,
		nlinks: 0,
		no_attrib: false,
	})
}

fn classify(meta: &fs::Metadata) -> EntryType {
	let ft = meta.file_type();
	if ft.is_dir() {
		EntryType::Dir
	} else if ft.is_symlink() {
		EntryType::Symlink
	} else if ft.is_file() {
		EntryType::File
	} else if ft.is_char_device() {
		EntryType::Chardev
	} else if ft.is_block_device() {
		EntryType::Blockdev
	} else if ft.is_socket() {
		// Sockets/FIFOs are treated as FILE-with-empty-digest.
		EntryType::File
	} else if ft.is_fifo() {
		EntryType::File
	} else {
		EntryType::Unknown
	}
}

/// Bytes to hash for a content-addressed entry. Symlinks are addressed by their target text;
/// device nodes carry no meaningful content and are treated as empty.
fn read_content_for_digest(path: &Path, kind: EntryType) -> std::io::Result<Vec<u8>> {
	match kind {
		EntryType::Symlink => {
			let target = fs::read_link(path)?;
			Ok(target.to_string_lossy().into_owned().into_bytes())
		}
		EntryType::Chardev | EntryType::Blockdev => Ok(Vec::new()),
		_ => fs::read(path),
	}
}

/// Resolves the V4 digest for one content-addressed record, reusing the per-backup
/// `Inode2Digest` memo for already-seen physical inodes. Only charges a pool
/// contribution on a memo miss — a second hard-linked path to the same inode does not double
/// the refcount.
fn migrate_content(
	pool_layout: &PoolLayout,
	pool_writer: &dyn PoolWriter,
	compress: bool,
	path: &Path,
	kind: EntryType,
	inode2digest: &mut HashMap<u64, Digest>,
	journal: &Rc<RefCell<DeltaJournal>>,
) -> std::io::Result<Digest> {
	let meta = fs::symlink_metadata(path)?;
	let ino = meta.ino();
	if let Some(d) = inode2digest.get(&ino) {
		return Ok(*d);
	}

	let bytes = read_content_for_digest(path, kind)?;
	let v4 = pool::v4_digest_bytes(&bytes);
	let v3 = pool::v3_digest(&bytes, bytes.len() as u64);
	reconcile_pool(pool_layout, pool_writer, path, ino, v4, v3, bytes.len() as u64)?;

	inode2digest.insert(ino, v4);
	journal.borrow_mut().update(compress, v4, 1);
	Ok(v4)
}

/// Pool reconciliation: make sure the V4 pool actually holds the
/// blob, preferring to adopt an existing V3 physical file (by inode match) over writing a fresh
/// copy.
fn reconcile_pool(
	pool_layout: &PoolLayout,
	pool_writer: &dyn PoolWriter,
	src_path: &Path,
	ino: u64,
	v4_digest: Digest,
	v3_digest: Digest,
	total_size: u64,
) -> std::io::Result<()> {
	// a. Empty file: considered in-pool by convention, nothing to link or write.
	if total_size == 0 {
		return Ok(());
	}

	// b. V4 pool path already holds this exact physical file.
	let v4_path = pool_layout.path_for(&v4_digest);
	if let Ok(meta) = fs::metadata(&v4_path) {
		if meta.ino() == ino {
			return Ok(());
		}
	}

	// c. Scan the V3 pool chain for a physical match; adopt it into the V4 path.
	for candidate in pool_layout.path_for_v3_chain(&v3_digest) {
		let Ok(meta) = fs::metadata(&candidate) else {
			continue;
		};
		if meta.ino() != ino {
			continue;
		}
		if let Some(parent) = v4_path.parent() {
			fs::create_dir_all(parent)?;
		}
		if let Err(e) = fs::hard_link(&candidate, &v4_path) {
			// Benign if the path is now present with the right inode regardless (e.g. a
			// concurrent migration already linked it); otherwise the error is real.
			let recovered = fs::metadata(&v4_path).map(|m| m.ino() == ino).unwrap_or(false);
			if !recovered {
				return Err(e);
			}
		} else {
			let _ = fs::remove_file(&candidate);
		}
		return Ok(());
	}

	// d. No physical match found anywhere: stream the content through the pool writer, which
	// dedups against existing V4 content by digest.
	let mut f = fs::File::open(src_path)?;
	pool_writer.write_stream(&mut f)?;
	Ok(())
}
