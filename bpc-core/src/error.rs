//! Typed engine failures.

use std::path::PathBuf;

/// Failure modes the engine can report. Category 2-4 failures (read errors, write errors,
/// accounting inconsistencies) are normally *not* propagated as `Err` from a run: they are
/// logged and folded into [`crate::engine::EngineState::errors`] so the rest of the tree keeps
/// being processed. This enum exists for the genuinely aborting cases (category 1 and 5) and
/// for collaborators (`AttribContainerStore`, `DeltaJournal`) to report a single failed
/// operation to their caller, who decides whether to count-and-continue or abort.
#[derive(Debug, thiserror::Error)]
pub enum BpcError {
	#[error("{0}: {1}")]
	Io(PathBuf, #[source] std::io::Error),

	#[error("{0}: corrupt container: {1}")]
	Decode(PathBuf, #[source] bincode::Error),

	#[error("backup #{0} has `keep` set; pass the override flag to delete it anyway")]
	KeepSet(u32),

	#[error("cannot merge: backup #{0} is compressed but predecessor #{1} is not (or vice versa)")]
	CompressionMismatch(u32, u32),

	#[error("backup #{0} not found for host {1}")]
	BackupNotFound(u32, String),

	#[error("backup #{0} already has refCnt/: already migrated")]
	AlreadyMigrated(u32),

	#[error("server is running; refusing to migrate")]
	ServerRunning,

	#[error("attribute record references inode {0}, which is absent from the inode table")]
	MissingInode(u64),

	#[error("cannot acquire host lock for {0}")]
	LockUnavailable(String),

	#[error("{0}")]
	Other(String),
}

pub type BpcResult<T> = Result<T, BpcError>;
