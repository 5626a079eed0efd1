//! Async Process Identifier allocation.
//!
//! Grounds `AsyncJobRouter.cpp`'s `apidGenerator`, persisted to a
//! `next-apid` counter file (spec.md section 6, "Persistence layout") so
//! APIDs stay strictly increasing across restarts (spec.md section 8,
//! "APID monotonicity").

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;

pub struct ApidGenerator {
    next: AtomicU64,
    counter_file: PathBuf,
}

impl ApidGenerator {
    /// Loads the next APID to allocate from `counter_file`, defaulting to 0
    /// if the file doesn't exist yet.
    pub async fn load(counter_file: PathBuf) -> std::io::Result<Self> {
        let next = match tokio::fs::read_to_string(&counter_file).await {
            Ok(contents) => contents.trim().parse().unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(ApidGenerator {
            next: AtomicU64::new(next),
            counter_file,
        })
    }

    /// Allocates the next APID and persists the new counter value before
    /// returning, so a crash right after allocation can never hand out the
    /// same id twice.
    pub async fn allocate(&self) -> std::io::Result<u64> {
        let apid = self.next.fetch_add(1, Ordering::SeqCst);
        persist(&self.counter_file, apid + 1).await?;
        Ok(apid)
    }
}

async fn persist(path: &Path, value: u64) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(value.to_string().as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_at_zero_without_a_counter_file() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ApidGenerator::load(dir.path().join("next-apid")).await.unwrap();
        assert_eq!(generator.allocate().await.unwrap(), 0);
        assert_eq!(generator.allocate().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn apids_are_monotone_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let counter_file = dir.path().join("next-apid");

        let first = ApidGenerator::load(counter_file.clone()).await.unwrap();
        assert_eq!(first.allocate().await.unwrap(), 0);
        assert_eq!(first.allocate().await.unwrap(), 1);
        drop(first);

        let second = ApidGenerator::load(counter_file).await.unwrap();
        assert_eq!(second.allocate().await.unwrap(), 2);
    }
}
