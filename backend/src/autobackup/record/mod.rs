//! 去重记录模块

pub mod hashing;
pub mod journal;

pub use hashing::{HashHandle, HashingReader};
pub use journal::{
    calculate_full_md5, fingerprint_file, journal_key, modified_millis, Journal, JournalEntry,
    JournalPool,
};
