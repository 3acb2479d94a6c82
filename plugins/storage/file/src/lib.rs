mod format;
mod storage;

pub use format::METADATA_FILE;
pub use storage::FileStorage;
