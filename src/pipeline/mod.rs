//! Asynchronous event pipeline
//!
//! A [`Pipeline`] owns one [`RingBuffer`] and a dedicated thread per
//! [`EventHandler`]. Producers publish serialized payloads; every handler sees
//! every slot in sequence order, batched between wake-ups. A handler error
//! skips that slot only.

pub mod envelope;
pub mod forwarder;
pub mod journal;
pub mod ring;

pub use envelope::JournalRecord;
pub use forwarder::Forwarder;
pub use journal::{Journaler, MemoryRepository};
pub use ring::{RingBuffer, SlotClaim};

use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::{Error, Result};

/// Consumer side of a pipeline
pub trait EventHandler: Send + 'static {
    /// Called once per published slot, in sequence order. `end_of_batch`
    /// marks the last slot that was available at this wake-up.
    fn on_next(&mut self, payload: &[u8], sequence: u64, end_of_batch: bool) -> Result<()>;

    fn on_start(&mut self) {}

    fn on_shutdown(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub published: u64,
    pub consumed: u64,
    pub producer_stalls: u64,
    pub consumer_errors: u64,
}

pub struct PipelineBuilder {
    name: String,
    capacity: usize,
    slot_size: usize,
    handlers: Vec<Box<dyn EventHandler>>,
    cores: Vec<usize>,
}

impl PipelineBuilder {
    pub fn handler(mut self, handler: impl EventHandler) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn boxed_handler(mut self, handler: Box<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Pin consumer threads to cores, in handler order
    pub fn cores(mut self, cores: Vec<usize>) -> Self {
        self.cores = cores;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let ring = RingBuffer::new(self.capacity, self.slot_size, self.handlers.len())?;
        Ok(Pipeline {
            name: self.name,
            ring: Arc::new(ring),
            idle: Mutex::new(self.handlers),
            workers: Mutex::new(Vec::new()),
            publishers: RwLock::new(()),
            running: Arc::new(AtomicBool::new(false)),
            errors: Arc::new(AtomicU64::new(0)),
            cores: self.cores,
        })
    }
}

pub struct Pipeline {
    name: String,
    ring: Arc<RingBuffer>,
    /// Handlers parked while the pipeline is stopped
    idle: Mutex<Vec<Box<dyn EventHandler>>>,
    workers: Mutex<Vec<JoinHandle<Box<dyn EventHandler>>>>,
    /// Held shared by each publish; `stop` takes it exclusively to flip `running`
    publishers: RwLock<()>,
    running: Arc<AtomicBool>,
    errors: Arc<AtomicU64>,
    cores: Vec<usize>,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>, capacity: usize, slot_size: usize) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            capacity,
            slot_size,
            handlers: Vec::new(),
            cores: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Spawn one consumer thread per handler. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let handlers = std::mem::take(&mut *self.idle.lock());
        for (index, handler) in handlers.into_iter().enumerate() {
            let ring = Arc::clone(&self.ring);
            let running = Arc::clone(&self.running);
            let errors = Arc::clone(&self.errors);
            let name = self.name.clone();
            let core = self.cores.get(index).copied();

            let handle = std::thread::Builder::new()
                .name(format!("{}-consumer-{}", self.name, index))
                .spawn(move || {
                    if let Some(id) = core {
                        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                            warn!(pipeline = %name, core = id, "failed to pin consumer thread");
                        }
                    }
                    run_consumer(&name, &ring, index, handler, &running, &errors)
                })
                .map_err(|e| Error::Pipeline(format!("failed to spawn consumer for {}: {}", self.name, e)))?;
            workers.push(handle);
        }

        info!(pipeline = %self.name, capacity = self.ring.capacity(), consumers = workers.len(), "pipeline started");
        Ok(())
    }

    /// Stop consumers after they drain everything already published. Idempotent.
    ///
    /// Waits for in-flight publishes; any publish after that is rejected.
    pub fn stop(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        {
            let _exclusive = self.publishers.write();
            if !self.running.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
        }

        let mut failed = 0;
        let mut idle = self.idle.lock();
        for handle in workers.drain(..) {
            match handle.join() {
                Ok(handler) => idle.push(handler),
                Err(_) => failed += 1,
            }
        }

        let stats = self.stats();
        info!(
            pipeline = %self.name,
            published = stats.published,
            consumed = stats.consumed,
            stalls = stats.producer_stalls,
            errors = stats.consumer_errors,
            "pipeline stopped"
        );
        if failed > 0 {
            return Err(Error::Pipeline(format!("{} consumer thread(s) of {} died", failed, self.name)));
        }
        Ok(())
    }

    /// Publish raw bytes, stalling while the ring is full.
    pub fn publish(&self, payload: &[u8]) -> Result<u64> {
        let _shared = self.publishers.read();
        if !self.is_running() {
            return Err(Error::Pipeline(format!("pipeline {} is not running", self.name)));
        }
        self.ring.publish(payload)
    }

    /// Serialize `record` as JSON and publish it.
    pub fn publish_record<T: Serialize>(&self, record: &T) -> Result<u64> {
        let bytes = envelope::encode(record, self.ring.slot_size())?;
        self.publish(&bytes)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            published: self.ring.published(),
            consumed: self.ring.consumed(),
            producer_stalls: self.ring.stalls(),
            consumer_errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                error!(pipeline = %self.name, error = %e, "pipeline stop on drop failed");
            }
        }
    }
}

fn run_consumer(
    name: &str,
    ring: &RingBuffer,
    index: usize,
    mut handler: Box<dyn EventHandler>,
    running: &AtomicBool,
    errors: &AtomicU64,
) -> Box<dyn EventHandler> {
    handler.on_start();
    let gate = ring.gate(index);
    let mut next = gate.load(Ordering::Acquire);
    let backoff = Backoff::new();

    loop {
        let available = ring.published();
        if available > next {
            backoff.reset();
            let last = available - 1;
            for sequence in next..available {
                // Safe: `sequence` is published and our gate has not passed it.
                let payload = unsafe { ring.read(sequence) };
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    handler.on_next(payload, sequence, sequence == last)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                        warn!(pipeline = %name, sequence, error = %e, "consumer failed, slot skipped");
                    }
                    Err(_) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                        error!(pipeline = %name, sequence, "consumer panicked, slot skipped");
                    }
                }
                gate.store(sequence + 1, Ordering::Release);
            }
            next = available;
        } else if !running.load(Ordering::Acquire) {
            // Re-check after observing the stop flag so nothing published
            // before stop() is left behind.
            if ring.published() == next {
                break;
            }
        } else if backoff.is_completed() {
            std::thread::park_timeout(Duration::from_micros(200));
        } else {
            backoff.snooze();
        }
    }

    debug!(pipeline = %name, consumer = index, position = next, "consumer drained");
    handler.on_shutdown();
    handler
}
