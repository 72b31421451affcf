//! Per-host backup index (`<TopDir>/pc/<host>/backups`) and merge-candidate selection.

use crate::model::BackupMeta;
use std::fs;
use std::path::Path;

/// Loads and saves the list of backups for one host, stored as a JSON array (chosen over the
/// pool's binary containers so the index stays diffable/greppable in production).
pub struct BackupList {
	pub backups: Vec<BackupMeta>,
}

impl BackupList {
	pub fn load(host_dir: &Path) -> std::io::Result<Self> {
		let path = host_dir.join("backups");
		let backups = match fs::read_to_string(&path) {
			Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
			Err(e) => return Err(e),
		};
		Ok(Self { backups })
	}

	pub fn save(&self, host_dir: &Path) -> std::io::Result<()> {
		fs::create_dir_all(host_dir)?;
		let text = serde_json::to_string_pretty(&self.backups).expect("backup list is plain data");
		fs::write(host_dir.join("backups"), text)
	}

	pub fn find(&self, num: u32) -> Option<&BackupMeta> {
		self.backups.iter().find(|b| b.num == num)
	}

	pub fn find_mut(&mut self, num: u32) -> Option<&mut BackupMeta> {
		self.backups.iter_mut().find(|b| b.num == num)
	}

	/// The immediate predecessor of `num`: the highest-numbered backup strictly less than it.
	pub fn predecessor_of(&self, num: u32) -> Option<&BackupMeta> {
		self.backups
			.iter()
			.filter(|b| b.num < num)
			.max_by_key(|b| b.num)
	}

	/// Removes a backup's entry from the index (whole-backup delete).
	pub fn remove(&mut self, num: u32) {
		self.backups.retain(|b| b.num != num);
	}

	/// Whether merge applies: target is V4 and the candidate exists, is V4, and is `noFill`
///
	pub fn merge_candidate(&self, target_num: u32) -> Option<&BackupMeta> {
		let target = self.find(target_num)?;
		if !target.is_v4() {
			return None;
		}
		let candidate = self.predecessor_of(target_num)?;
		if candidate.is_v4() && candidate.no_fill {
			Some(candidate)
		} else {
			None
		}
	}
}
