//! Structured logging setup shared by `backupDelete` and `migrateV3toV4`.
//!
//! The line-marker progress protocol (`__bpc_progress_*__`) is NOT routed through this: it is
//! a parser contract with the supervisor and lives in [`crate::progress`] instead.

use log::LevelFilter;

/// Initializes the `log` facade at the given verbosity.
///
/// `xfer_log_level` follows the legacy convention: 0 is quiet, higher is noisier. `-v` on
/// `migrateV3toV4` bumps it by one level.
pub fn init(xfer_log_level: u8) {
	let level = match xfer_log_level {
		0 => LevelFilter::Warn,
		1 => LevelFilter::Info,
		2 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	};
	let _ = env_logger::Builder::new()
		.filter_level(level)
		.format_timestamp_secs()
		.try_init();
}
