//! Attribute-Container Store, Delta Refcount Journal, Deletion/Merge engines, and the V3→V4
//! Migration engine for a content-addressed, deduplicated, reference-counted backup pool.

pub mod ac;
pub mod backups;
pub mod del;
pub mod drc;
pub mod engine;
pub mod error;
pub mod mangle;
pub mod mig;
pub mod model;
pub mod mrg;
pub mod pool;
pub mod sentinel;
pub mod walk;

pub use ac::AttribContainerStore;
pub use backups::BackupList;
pub use drc::DeltaJournal;
pub use engine::EngineState;
pub use error::{BpcError, BpcResult};
pub use model::{AttributeRecord, BackupMeta, Digest, EntryType};
pub use sentinel::Sentinel;
