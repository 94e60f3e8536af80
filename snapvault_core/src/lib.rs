//! # Snapvault Core
//!
//! A deduplicating backup engine built on a content-addressed store of
//! SHA-1 digests.
//!
//! Each distinct file and each distinct directory subtree is stored exactly
//! once. A backup is a dated folder of links into the store: files are
//! hardlinked, directories are symlinked, and store directories are
//! themselves folders of links to their children. A link's target path
//! encodes the digest it points to, so the object graph can be walked
//! without reading any content.
//!
//! ## Features
//!
//! - Merkle-hashed directories with whole-subtree deduplication
//! - Atomic publishing of files and directories into a sharded store
//! - Parallel hashing with an optional extended-attribute digest cache
//! - Reuse of an earlier snapshot to skip unchanged files
//! - Mark-and-sweep garbage collection from registered destinations
//! - Bucketed, time-based retention of snapshots
//!
//! ## Example
//!
//! ```no_run
//! use snapvault_core::{BackupOptions, GcOptions, BackupSource, Store};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Initialize a new store
//! let store = Store::init("./my-store")?;
//!
//! // Back up a directory into a dated snapshot
//! let options = BackupOptions::new(vec![BackupSource::new("./my-data")], "./backups");
//! let report = store.backup(&options)?;
//! println!("Snapshot at {:?}", report.root);
//!
//! // Reclaim objects no snapshot references any more
//! let stats = store.gc(&GcOptions::default())?;
//! println!("Deleted {} objects", stats.objects_deleted);
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod fsops;
mod gc;
mod hash;
mod previous;
mod refs;
mod retention;
mod store;
mod tree;
mod walk;

pub use cache::{CacheRecord, DEFAULT_CACHE_THRESHOLD, DigestCache, FileDigest};
pub use error::{Error, Result};
pub use fsops::{LinkFs, LinkOutcome, NativeFs};
pub use gc::{GcOptions, GcStats};
pub use hash::{ContentDigest, HasherPool, Kind};
pub use previous::{PreviousBackup, PreviousRoot};
pub use refs::RootRegistry;
pub use retention::{
    DEFAULT_DATE_FORMAT, DatePattern, PruneReport, RetentionPlan, RetentionPolicy, Rule, Snapshot,
    prune,
};
pub use store::{PublishReceipt, Store, StoreConfig, resolve};
pub use tree::{DirEntry, HashEntry, LiveLinkRef};
pub use walk::{
    BackupCounters, BackupOptions, BackupReport, BackupSource, CancelToken, ROOT_MARKER,
};
