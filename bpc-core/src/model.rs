//! The data model of §3: digests, attribute records, inode tables, backup metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-length content digest. Both the V4 and legacy V3 recipes produce 16-byte MD5
/// outputs; they differ only in the bytes that get hashed (§4.5).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Digest(pub [u8; 16]);

impl Digest {
	/// The empty digest: directories and data-less entries carry this.
	pub const EMPTY: Digest = Digest([0u8; 16]);

	/// Whether this digest is the empty placeholder (invariant 1 exempts these from pool
	/// bookkeeping).
	pub fn is_empty(&self) -> bool {
		*self == Self::EMPTY
	}

	/// Hex-encodes the digest, e.g. for `attrib_<hex>` file names.
	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	/// Parses a digest from its hex encoding.
	pub fn from_hex(s: &str) -> Option<Digest> {
		let bytes = hex::decode(s).ok()?;
		if bytes.len() != 16 {
			return None;
		}
		let mut arr = [0u8; 16];
		arr.copy_from_slice(&bytes);
		Some(Digest(arr))
	}
}

impl fmt::Debug for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Digest({})", self.to_hex())
	}
}

impl fmt::Display for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

/// Entry type, matching the legacy product's attribute-type enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
	File,
	Dir,
	Symlink,
	Hardlink,
	Chardev,
	Blockdev,
	Socket,
	Fifo,
	Deleted,
	Unknown,
}

impl EntryType {
	/// Whether this type carries pool-addressable content (§4.5 step 2).
	pub fn is_content_addressed(&self) -> bool {
		matches!(
			self,
			EntryType::File
				| EntryType::Symlink
				| EntryType::Hardlink
				| EntryType::Chardev
				| EntryType::Blockdev
		)
	}
}

/// A single filesystem entry's attributes, as stored in an attribute container (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
	pub name: String,
	pub kind: EntryType,
	pub mode: u32,
	pub uid: u32,
	pub gid: u32,
	pub size: u64,
	pub mtime: i64,
	/// Empty for directories and content-less entries.
	pub digest: Digest,
	/// Compression mode the digest is valid under.
	pub compress: bool,
	/// Key into the backup's inode table when `nlinks > 0`.
	pub inode: u64,
	/// 0 ⇒ no inode indirection; >0 ⇒ hard-link group member.
	pub nlinks: u32,
	/// Synthetic entry representing a directory seen only by directory scan (no attribute
	/// record of its own, §4.4 step 2).
	pub no_attrib: bool,
}

impl AttributeRecord {
	/// A synthetic `DIR` placeholder for a directory observed on disk but absent from the
	/// attribute container (§4.4 step 2, §4.5 step 1).
	pub fn synthetic_dir(name: &str, mode: u32, uid: u32, gid: u32, mtime: i64) -> Self {
		Self {
			name: name.to_owned(),
			kind: EntryType::Dir,
			mode,
			uid,
			gid,
			size: 0,
			mtime,
			digest: Digest::EMPTY,
			compress: false,
			inode: 0,
			nlinks: 0,
			no_attrib: true,
		}
	}

	pub fn is_dir(&self) -> bool {
		self.kind == EntryType::Dir
	}
}

/// Per-backup metadata tuple (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupMeta {
	pub num: u32,
	/// Whether this backup's pool contributions live in the compressed pool.
	pub compress: bool,
	/// On-disk layout version: 3 (legacy) or 4.
	pub version: u8,
	/// `true` ⇒ this backup is a delta against its predecessor.
	pub no_fill: bool,
	/// Whether deletion is refused unless overridden.
	pub keep: bool,
	/// Highest inode number assigned so far in this backup.
	pub inode_last: u64,
}

impl BackupMeta {
	pub fn is_v4(&self) -> bool {
		self.version == 4
	}
}
