use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::CheckpointError;

/// Durable progress of one sink processor.
///
/// `offsets` holds the next offset to consume per source partition. `state`
/// is an opaque document owned by the processor, committed atomically with
/// the offsets it corresponds to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorCheckpoint {
    pub offsets: BTreeMap<i32, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
}

impl ProcessorCheckpoint {
    /// Folds `proposed` on top of this checkpoint, refusing to move any
    /// partition backwards. Partitions missing from `proposed` keep their
    /// current offset.
    pub fn advance(
        &self,
        processor: &str,
        proposed: &ProcessorCheckpoint,
    ) -> Result<ProcessorCheckpoint, CheckpointError> {
        let mut offsets = self.offsets.clone();
        for (&partition, &next) in &proposed.offsets {
            match offsets.get(&partition) {
                Some(&current) if next < current => {
                    return Err(CheckpointError::Regression {
                        processor: processor.to_owned(),
                        partition,
                        current,
                        proposed: next,
                    })
                }
                _ => {
                    offsets.insert(partition, next);
                }
            }
        }

        Ok(ProcessorCheckpoint {
            offsets,
            state: proposed.state.clone(),
        })
    }
}

/// Process-wide store of every processor's checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, processor: &str) -> Result<Option<ProcessorCheckpoint>, CheckpointError>;

    /// Compare-and-swap per partition: fails with `Regression` if any offset
    /// would move backwards, leaving the stored checkpoint untouched.
    async fn commit(
        &self,
        processor: &str,
        checkpoint: &ProcessorCheckpoint,
    ) -> Result<(), CheckpointError>;
}

/// Where the source should resume: per partition, the lowest offset any
/// processor still needs.
///
/// If a processor has no checkpoint at all it needs the whole log, so the
/// result is empty. A partition missing from some processor's checkpoint is
/// left out and starts from the source's reset policy.
pub async fn resume_offsets(
    store: &dyn CheckpointStore,
    processors: &[&str],
) -> Result<BTreeMap<i32, i64>, CheckpointError> {
    let mut checkpoints = Vec::with_capacity(processors.len());
    for processor in processors {
        match store.load(processor).await? {
            Some(checkpoint) => checkpoints.push(checkpoint),
            None => {
                info!(processor, "no checkpoint, resuming from the start of the log");
                return Ok(BTreeMap::new());
            }
        }
    }

    Ok(low_watermark(checkpoints.iter().map(|c| &c.offsets)))
}

pub fn low_watermark<'a>(
    offsets: impl IntoIterator<Item = &'a BTreeMap<i32, i64>>,
) -> BTreeMap<i32, i64> {
    let mut offsets = offsets.into_iter();
    let Some(first) = offsets.next() else {
        return BTreeMap::new();
    };

    let mut low = first.clone();
    for other in offsets {
        low.retain(|partition, _| other.contains_key(partition));
        for (partition, next) in low.iter_mut() {
            if let Some(&theirs) = other.get(partition) {
                *next = (*next).min(theirs);
            }
        }
    }
    low
}

/// One `<processor>.json` document per processor in a local directory.
pub struct FileCheckpointStore {
    location: PathBuf,
    // Serializes commits and caches the last durable checkpoint of each processor
    committed: tokio::sync::Mutex<HashMap<String, ProcessorCheckpoint>>,
}

impl FileCheckpointStore {
    pub async fn open(location: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let location = location.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&location)
            .await
            .map_err(|source| CheckpointError::Medium {
                processor: location.display().to_string(),
                source,
            })?;

        info!(location = %location.display(), "opened checkpoint store");
        Ok(Self {
            location,
            committed: Default::default(),
        })
    }

    fn path(&self, processor: &str) -> PathBuf {
        self.location.join(format!("{processor}.json"))
    }

    async fn read(&self, processor: &str) -> Result<Option<ProcessorCheckpoint>, CheckpointError> {
        let bytes = match tokio::fs::read(self.path(processor)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Medium {
                    processor: processor.to_owned(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt {
                processor: processor.to_owned(),
                source,
            })
    }

    async fn write(
        &self,
        processor: &str,
        checkpoint: &ProcessorCheckpoint,
    ) -> Result<(), CheckpointError> {
        let medium = |source| CheckpointError::Medium {
            processor: processor.to_owned(),
            source,
        };
        let body = serde_json::to_vec_pretty(checkpoint).map_err(|source| {
            CheckpointError::Corrupt {
                processor: processor.to_owned(),
                source,
            }
        })?;

        let target = self.path(processor);
        let staging = self.location.join(format!("{processor}.json.tmp"));

        let mut file = tokio::fs::File::create(&staging).await.map_err(medium)?;
        file.write_all(&body).await.map_err(medium)?;
        file.sync_all().await.map_err(medium)?;
        drop(file);

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(medium)?;
        // Persist the rename itself
        tokio::fs::File::open(&self.location)
            .await
            .map_err(medium)?
            .sync_all()
            .await
            .map_err(medium)?;

        debug!(processor, path = %target.display(), "checkpoint written");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, processor: &str) -> Result<Option<ProcessorCheckpoint>, CheckpointError> {
        if let Some(cached) = self.committed.lock().await.get(processor) {
            return Ok(Some(cached.clone()));
        }
        self.read(processor).await
    }

    async fn commit(
        &self,
        processor: &str,
        checkpoint: &ProcessorCheckpoint,
    ) -> Result<(), CheckpointError> {
        let mut committed = self.committed.lock().await;
        let current = match committed.get(processor) {
            Some(current) => current.clone(),
            None => self.read(processor).await?.unwrap_or_default(),
        };

        let next = current.advance(processor, checkpoint)?;
        self.write(processor, &next).await?;
        committed.insert(processor.to_owned(), next);
        Ok(())
    }
}

/// In-memory store for tests. The medium can be taken away with
/// `set_unavailable`, and `restore` rolls checkpoints back to an earlier
/// snapshot as if the last commits never reached disk.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, ProcessorCheckpoint>>,
    unavailable: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> HashMap<String, ProcessorCheckpoint> {
        self.checkpoints
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default()
    }

    pub fn restore(&self, snapshot: HashMap<String, ProcessorCheckpoint>) {
        if let Ok(mut map) = self.checkpoints.lock() {
            *map = snapshot;
        }
    }

    fn check_medium(&self, processor: &str) -> Result<(), CheckpointError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CheckpointError::Medium {
                processor: processor.to_owned(),
                source: std::io::Error::new(ErrorKind::Other, "checkpoint medium unavailable"),
            });
        }
        Ok(())
    }

    fn poisoned(processor: &str) -> CheckpointError {
        CheckpointError::Medium {
            processor: processor.to_owned(),
            source: std::io::Error::new(ErrorKind::Other, "checkpoint lock poisoned"),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, processor: &str) -> Result<Option<ProcessorCheckpoint>, CheckpointError> {
        self.check_medium(processor)?;
        let map = self
            .checkpoints
            .lock()
            .map_err(|_| Self::poisoned(processor))?;
        Ok(map.get(processor).cloned())
    }

    async fn commit(
        &self,
        processor: &str,
        checkpoint: &ProcessorCheckpoint,
    ) -> Result<(), CheckpointError> {
        self.check_medium(processor)?;
        let mut map = self
            .checkpoints
            .lock()
            .map_err(|_| Self::poisoned(processor))?;

        let next = map
            .get(processor)
            .cloned()
            .unwrap_or_default()
            .advance(processor, checkpoint)?;
        map.insert(processor.to_owned(), next);
        Ok(())
    }
}
