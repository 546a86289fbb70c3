pub mod error;
pub mod record;
pub mod store;

pub use error::{ArchiveError, ArchiveResult};
pub use record::TransactionRecord;
pub use store::{DirectoryStore, RECORD_EXTENSION, RecordStore};
