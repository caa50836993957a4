//! Document and account store adapters.

mod feed;
mod file;
mod memory;

pub use feed::ChangeFeed;
pub use file::FileDocumentStore;
pub use memory::MemoryDocumentStore;

/// Next server timestamp for a document: wall clock, but strictly after the previous write.
pub(crate) fn next_timestamp(previous: Option<i64>) -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    match previous {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}
