//! The line-marker progress protocol consumed by the supervisor:
//!
//! ```text
//! __bpc_pidStart__ PID
//! __bpc_pidEnd__ PID
//! __bpc_progress_state__ state
//! __bpc_progress_fileCnt__ fileCnt dirCnt byteCnt
//! xferPids P1,P2,...
//! ```
//!
//! These are written verbatim to stdout, not through `log!`, since the supervisor's parser
//! keys off the exact text. `-p` suppresses all of them; `-L` additionally tees stdout to a
//! per-host log file.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

/// Sink for the progress-marker protocol.
pub struct Progress {
	quiet: bool,
	tee: Option<Sender<String>>,
	tee_handle: Option<JoinHandle<()>>,
}

impl Progress {
	/// Creates a sink that writes to stdout only (`-p` not given, `-L` not given).
	pub fn new(quiet: bool) -> Self {
		Self {
			quiet,
			tee: None,
			tee_handle: None,
		}
	}

	/// Creates a sink that additionally tees every line to `<log_dir>/<host>.log` (`-L`).
	pub fn with_tee(quiet: bool, log_dir: &Path, host: &str) -> io::Result<Self> {
		let log_path: PathBuf = log_dir.join(format!("{host}.log"));
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&log_path)?;
		let (tx, rx) = mpsc::channel::<String>();
		let handle = thread::spawn(move || {
			for line in rx {
				let _ = writeln!(file, "{line}");
			}
		});
		Ok(Self {
			quiet,
			tee: Some(tx),
			tee_handle: Some(handle),
		})
	}

	fn emit(&self, line: String) {
		if !self.quiet {
			println!("{line}");
		}
		if let Some(tx) = &self.tee {
			let _ = tx.send(line);
		}
	}

	/// `__bpc_pidStart__ PID`, emitted before the first mutating step.
	pub fn pid_start(&self) {
		self.emit(format!("__bpc_pidStart__ {}", process::id()));
	}

	/// `__bpc_pidEnd__ PID`, emitted exactly once as the run concludes, success or failure.
	pub fn pid_end(&self) {
		self.emit(format!("__bpc_pidEnd__ {}", process::id()));
	}

	/// `__bpc_progress_state__ STATE`.
	pub fn state(&self, state: &str) {
		self.emit(format!("__bpc_progress_state__ {state}"));
	}

	/// `__bpc_progress_fileCnt__ files dirs bytes`.
	pub fn file_cnt(&self, files: u64, dirs: u64, bytes: u64) {
		self.emit(format!(
			"__bpc_progress_fileCnt__ {files} {dirs} {bytes}"
		));
	}

	/// `xferPids P1,P2,...` (always empty for this engine: no xfer sub-processes are spawned,
	/// but the marker is still emitted so supervisors expecting it do not time out).
	pub fn xfer_pids(&self, pids: &[u32]) {
		let joined = pids
			.iter()
			.map(u32::to_string)
			.collect::<Vec<_>>()
			.join(",");
		self.emit(format!("xferPids {joined}"));
	}
}

impl Drop for Progress {
	fn drop(&mut self) {
		// Dropping the sender lets the tee thread's `for line in rx` loop end.
		self.tee.take();
		if let Some(h) = self.tee_handle.take() {
			let _ = h.join();
		}
	}
}
