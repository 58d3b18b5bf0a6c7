use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::firestore::error::{
    data_loss, primary_lease_lost, unavailable, FirestoreError, FirestoreResult,
};
use crate::firestore::local::persistence::{Persistence, TableDelta, TableSet};

const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TEMP_FILE: &str = "snapshot.json.tmp";
const JOURNAL_FILE: &str = "journal.jsonl";
const LEASE_FILE: &str = "owner.lease";

/// Journal length after which a fresh snapshot is written.
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 256;

/// Durable backend that keeps a JSON snapshot plus an append-only journal
/// of committed transactions in one directory.
///
/// Only one instance may own a directory. Starting a second instance takes
/// the lease over, and the previous owner fails its next commit with a
/// primary-lease-lost error.
#[derive(Debug)]
pub struct FilePersistence {
    directory: PathBuf,
    owner_id: String,
    checkpoint_interval: usize,
    journal_entries: AtomicUsize,
}

impl FilePersistence {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            owner_id: format!("{:016x}", rand::random::<u64>()),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            journal_entries: AtomicUsize::new(0),
        }
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    async fn verify_lease(&self) -> FirestoreResult<()> {
        match fs::read_to_string(self.path(LEASE_FILE)).await {
            Ok(owner) if owner.trim() == self.owner_id => Ok(()),
            Ok(_) => Err(primary_lease_lost()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(primary_lease_lost()),
            Err(err) => Err(storage_error("read lease", err)),
        }
    }

    async fn load_snapshot(&self) -> FirestoreResult<TableSet> {
        match fs::read(self.path(SNAPSHOT_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| data_loss(format!("corrupt snapshot: {err}"))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(TableSet::default()),
            Err(err) => Err(storage_error("read snapshot", err)),
        }
    }

    async fn replay_journal(&self, tables: &mut TableSet) -> FirestoreResult<usize> {
        let contents = match fs::read_to_string(self.path(JOURNAL_FILE)).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(storage_error("read journal", err)),
        };
        let lines: Vec<&str> = contents.lines().filter(|line| !line.is_empty()).collect();
        let mut replayed = 0;
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<TableDelta>(line) {
                Ok(delta) => {
                    tables.apply(delta);
                    replayed += 1;
                }
                // A torn final line is a commit that never completed.
                Err(err) if index + 1 == lines.len() => {
                    log::warn!("discarding incomplete journal entry: {err}");
                    let mut intact = lines[..index].join("\n");
                    if !intact.is_empty() {
                        intact.push('\n');
                    }
                    fs::write(self.path(JOURNAL_FILE), intact)
                        .await
                        .map_err(|err| storage_error("repair journal", err))?;
                }
                Err(err) => {
                    return Err(data_loss(format!("corrupt journal entry {index}: {err}")));
                }
            }
        }
        Ok(replayed)
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn start(&self) -> FirestoreResult<TableSet> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|err| storage_error("create directory", err))?;
        fs::write(self.path(LEASE_FILE), self.owner_id.as_bytes())
            .await
            .map_err(|err| storage_error("write lease", err))?;

        let mut tables = self.load_snapshot().await?;
        let replayed = self.replay_journal(&mut tables).await?;
        self.journal_entries.store(replayed, Ordering::SeqCst);
        log::debug!(
            "loaded local tables from {} ({replayed} journal entries)",
            self.directory.display()
        );
        Ok(tables)
    }

    async fn commit(&self, delta: &TableDelta) -> FirestoreResult<()> {
        self.verify_lease().await?;
        let mut line = serde_json::to_string(delta)
            .map_err(|err| data_loss(format!("failed to encode transaction: {err}")))?;
        line.push('\n');

        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(JOURNAL_FILE))
            .await
            .map_err(|err| storage_error("open journal", err))?;
        journal
            .write_all(line.as_bytes())
            .await
            .map_err(|err| storage_error("append journal", err))?;
        journal
            .sync_data()
            .await
            .map_err(|err| storage_error("sync journal", err))?;
        self.journal_entries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wants_checkpoint(&self) -> bool {
        self.journal_entries.load(Ordering::SeqCst) >= self.checkpoint_interval
    }

    async fn checkpoint(&self, tables: &TableSet) -> FirestoreResult<()> {
        self.verify_lease().await?;
        let bytes = serde_json::to_vec(tables)
            .map_err(|err| data_loss(format!("failed to encode snapshot: {err}")))?;
        let temp = self.path(SNAPSHOT_TEMP_FILE);
        fs::write(&temp, bytes)
            .await
            .map_err(|err| storage_error("write snapshot", err))?;
        fs::rename(&temp, self.path(SNAPSHOT_FILE))
            .await
            .map_err(|err| storage_error("install snapshot", err))?;
        // Replaying the old journal over the new snapshot is harmless, so a
        // crash before truncation loses nothing.
        fs::write(self.path(JOURNAL_FILE), b"")
            .await
            .map_err(|err| storage_error("truncate journal", err))?;
        self.journal_entries.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> FirestoreResult<()> {
        if self.verify_lease().await.is_ok() {
            fs::remove_file(self.path(LEASE_FILE))
                .await
                .map_err(|err| storage_error("release lease", err))?;
        }
        Ok(())
    }

    fn uses_eager_gc(&self) -> bool {
        false
    }
}

fn storage_error(operation: &str, err: std::io::Error) -> FirestoreError {
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            FirestoreError::transient_storage(format!("{operation} failed: {err}"))
        }
        _ => unavailable(format!("{operation} failed: {err}")),
    }
}
