//! Environment configuration: `TopDir`, `BinDir`, `LogDir`, server coordinates and log level.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// The single config map the engine and both CLIs read from, matching the legacy product's
/// `/etc/backuppc/config.toml` (default path, overridable with `BPC_CONFIG`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// Root of `pc/`, `pool/` and `cpool/`.
	pub top_dir: PathBuf,
	/// Directory holding auxiliary binaries (unused by the core engine, kept for parity).
	#[serde(default = "default_bin_dir")]
	pub bin_dir: PathBuf,
	/// Directory receiving per-host tee'd logs (`-L`).
	#[serde(default = "default_log_dir")]
	pub log_dir: PathBuf,
	/// Host name of the coordinating server process.
	#[serde(default = "default_server_host")]
	pub server_host: String,
	/// Port of the coordinating server process.
	#[serde(default = "default_server_port")]
	pub server_port: u16,
	/// Verbosity passed down to transfer logging.
	#[serde(default)]
	pub xfer_log_level: u8,
	/// `RefCntFsck == 0` in the legacy config: when `true`, sentinels are never opportunistically
	/// cleared and a full fsck is mandatory after every run.
	#[serde(default)]
	pub ref_cnt_fsck: bool,
	/// When `true`, attribute containers recovered via the pre-release/corrupt-body fallback are
	/// left untouched on flush instead of being upgraded to current format. Lets a deployment (or
	/// a test) force the one-way upgrade path by flipping this at runtime instead of a rebuild.
	#[serde(default)]
	pub legacy_read_only: bool,
}

fn default_bin_dir() -> PathBuf {
	PathBuf::from("/usr/local/BackupPC/bin")
}

fn default_log_dir() -> PathBuf {
	PathBuf::from("/var/log/BackupPC")
}

fn default_server_host() -> String {
	"localhost".to_owned()
}

fn default_server_port() -> u16 {
	4413
}

/// Error loading or parsing the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("{0}: {1}")]
	Io(PathBuf, std::io::Error),
	#[error("{0}: {1}")]
	Parse(PathBuf, toml::de::Error),
}

impl Config {
	/// Loads the config from `BPC_CONFIG` (default `/etc/backuppc/config.toml`), applying
	/// environment overrides afterwards.
	pub fn load() -> Result<Self, ConfigError> {
		let path = env::var_os("BPC_CONFIG")
			.map(PathBuf::from)
			.unwrap_or_else(|| PathBuf::from("/etc/backuppc/config.toml"));
		Self::load_from(&path)
	}

	/// Loads the config from an explicit path, applying environment overrides afterwards.
	pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path)
			.map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
		let mut cfg: Config =
			toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
		cfg.apply_env_overrides();
		Ok(cfg)
	}

	fn apply_env_overrides(&mut self) {
		if let Some(v) = env::var_os("BPC_TOPDIR") {
			self.top_dir = PathBuf::from(v);
		}
		if let Some(v) = env::var_os("BPC_BINDIR") {
			self.bin_dir = PathBuf::from(v);
		}
		if let Some(v) = env::var_os("BPC_LOGDIR") {
			self.log_dir = PathBuf::from(v);
		}
		if let Ok(v) = env::var("BPC_SERVERHOST") {
			self.server_host = v;
		}
		if let Ok(v) = env::var("BPC_SERVERPORT") {
			if let Ok(port) = v.parse() {
				self.server_port = port;
			}
		}
		if let Ok(v) = env::var("BPC_XFERLOGLEVEL") {
			if let Ok(lvl) = v.parse() {
				self.xfer_log_level = lvl;
			}
		}
		if env::var_os("BPC_REFCNTFSCK").is_some() {
			self.ref_cnt_fsck = true;
		}
	}

	/// Root of a host's backups: `<TopDir>/pc/<host>`.
	pub fn host_dir(&self, host: &str) -> PathBuf {
		self.top_dir.join("pc").join(host)
	}

	/// Root of a specific backup: `<TopDir>/pc/<host>/<num>`.
	pub fn backup_dir(&self, host: &str, num: u32) -> PathBuf {
		self.host_dir(host).join(num.to_string())
	}

	/// Root of the uncompressed or compressed pool.
	pub fn pool_dir(&self, compress: bool) -> PathBuf {
		self.top_dir.join(if compress { "cpool" } else { "pool" })
	}
}
