//! Persistence consumer - decodes slots and saves them through a repository

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{Error, Repository, Result};
use crate::pipeline::{EventHandler, envelope};

/// Saved/dropped counts of a [`Journaler`], readable from other threads
#[derive(Debug, Default)]
pub struct JournalStats {
    saved: AtomicU64,
    dropped: AtomicU64,
}

impl JournalStats {
    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Sole consumer of a journal pipeline. At-most-once: an entity that fails to
/// decode or save is dropped and the error handed back to the pipeline.
pub struct Journaler<T> {
    repository: Arc<dyn Repository<T>>,
    stats: Arc<JournalStats>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Journaler<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(repository: Arc<dyn Repository<T>>) -> Self {
        Self {
            repository,
            stats: Arc::new(JournalStats::default()),
            _entity: PhantomData,
        }
    }

    pub fn stats(&self) -> Arc<JournalStats> {
        Arc::clone(&self.stats)
    }
}

impl<T> EventHandler for Journaler<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn on_next(&mut self, payload: &[u8], sequence: u64, _end_of_batch: bool) -> Result<()> {
        let entity: T = envelope::decode(payload, sequence).inspect_err(|_| {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        })?;

        match self.repository.save(entity) {
            Ok(()) => {
                self.stats.saved.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::ConsumerProcessing {
                    sequence,
                    reason: format!("save failed: {}", e),
                })
            }
        }
    }
}

/// Repository that keeps everything in memory
pub struct MemoryRepository<T> {
    items: Mutex<Vec<T>>,
}

impl<T: Clone> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T: Clone> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Repository<T> for MemoryRepository<T> {
    fn save(&self, entity: T) -> Result<()> {
        self.items.lock().push(entity);
        Ok(())
    }
}
