//! Run-scoped engine state: the "global" counters and handles threaded through `DEL`/`MRG`/`MIG`
//! these counters and handles belong to one state object, not free-floating statics.

use bpcutil::Progress;

/// Counters and shared handles for a single deletion/merge or migration run.
pub struct EngineState {
	pub file_cnt: u64,
	pub dir_cnt: u64,
	pub byte_cnt: u64,
	pub errors: u32,
	pub progress: Progress,
	/// Forwarded to every `AttribContainerStore` this run creates, via
	/// `AttribContainerStore::set_legacy_read_only`. Defaults to `false`; set from
	/// `Config::legacy_read_only` by the CLI front-ends, or flipped directly by a test to force
	/// the one-way container-upgrade path without a rebuild.
	pub legacy_read_only: bool,
}

impl EngineState {
	pub fn new(progress: Progress) -> Self {
		Self {
			file_cnt: 0,
			dir_cnt: 0,
			byte_cnt: 0,
			errors: 0,
			progress,
			legacy_read_only: false,
		}
	}

	pub fn note_file(&mut self) {
		self.file_cnt += 1;
	}

	/// Accumulates the size of a record's content as it is processed, for the human-readable
	/// completion summary (`log::info!`, not the line-marker protocol, which reports raw counts).
	pub fn note_bytes(&mut self, size: u64) {
		self.byte_cnt += size;
	}

	pub fn note_dir(&mut self) {
		self.dir_cnt += 1;
	}

	/// Records a recoverable failure: logged, counted, processing
	/// continues.
	pub fn note_error(&mut self, context: &str) {
		self.errors += 1;
		log::error!("{context}");
	}

	pub fn report_progress(&self, state: &str) {
		self.progress.state(state);
		self.progress.file_cnt(self.file_cnt, self.dir_cnt, self.byte_cnt);
	}
}
