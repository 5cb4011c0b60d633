//! Fixed-capacity slot ring with claim/publish sequencing.
//!
//! Layout: `capacity` pre-allocated byte slots, a published cursor written by
//! the single claim holder, and one gating cursor per consumer. Sequence `s`
//! lives in slot `s & mask`; the producer may only claim `s` once every gate
//! has moved past `s - capacity`, so an unconsumed slot is never overwritten.

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::{Error, Result};

struct Slot {
    len: usize,
    data: Box<[u8]>,
}

pub struct RingBuffer {
    slots: Box<[UnsafeCell<Slot>]>,
    mask: u64,
    capacity: u64,
    slot_size: usize,
    /// Count of published slots, i.e. the next sequence to publish
    cursor: CachePadded<AtomicU64>,
    /// Per consumer: count of slots fully handled
    gates: Box<[CachePadded<AtomicU64>]>,
    claim_lock: Mutex<()>,
    stalls: AtomicU64,
}

// Slot contents are only touched by the claim-lock holder (for sequences no
// gate still needs) or by consumers (for published sequences not yet gated).
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(capacity: usize, slot_size: usize, consumers: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::Config(format!(
                "ring capacity must be a power of two, got {}",
                capacity
            )));
        }
        if slot_size == 0 {
            return Err(Error::Config("ring slot size must be non-zero".into()));
        }
        if consumers == 0 {
            return Err(Error::Config("ring needs at least one consumer".into()));
        }

        let slots = (0..capacity)
            .map(|_| {
                UnsafeCell::new(Slot {
                    len: 0,
                    data: vec![0u8; slot_size].into_boxed_slice(),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let gates = (0..consumers)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: (capacity - 1) as u64,
            capacity: capacity as u64,
            slot_size,
            cursor: CachePadded::new(AtomicU64::new(0)),
            gates,
            claim_lock: Mutex::new(()),
            stalls: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn consumers(&self) -> usize {
        self.gates.len()
    }

    /// Number of slots published so far
    pub fn published(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Slowest consumer's position
    pub fn consumed(&self) -> u64 {
        self.gates
            .iter()
            .map(|g| g.load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }

    /// Claims that had to wait for a consumer to free the wrap-around slot
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    fn has_room(&self, sequence: u64) -> bool {
        sequence - self.consumed() < self.capacity
    }

    /// Claim the next slot, waiting while the ring is full.
    pub fn claim(&self) -> SlotClaim<'_> {
        let guard = self.claim_lock.lock();
        let sequence = self.cursor.load(Ordering::Relaxed);

        if !self.has_room(sequence) {
            self.stalls.fetch_add(1, Ordering::Relaxed);
            let backoff = Backoff::new();
            while !self.has_room(sequence) {
                if backoff.is_completed() {
                    std::thread::sleep(Duration::from_micros(20));
                } else {
                    backoff.snooze();
                }
            }
        }

        SlotClaim {
            ring: self,
            _guard: guard,
            sequence,
        }
    }

    /// Claim without waiting; `None` when the ring is full.
    pub fn try_claim(&self) -> Option<SlotClaim<'_>> {
        let guard = self.claim_lock.lock();
        let sequence = self.cursor.load(Ordering::Relaxed);
        self.has_room(sequence).then(|| SlotClaim {
            ring: self,
            _guard: guard,
            sequence,
        })
    }

    /// Copy `payload` into the next slot and publish it.
    pub fn publish(&self, payload: &[u8]) -> Result<u64> {
        if payload.len() > self.slot_size {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                slot_size: self.slot_size,
            });
        }
        let mut claim = self.claim();
        claim.write(payload)?;
        Ok(claim.publish())
    }

    pub(crate) fn gate(&self, consumer: usize) -> &AtomicU64 {
        &self.gates[consumer]
    }

    /// Payload stored at `sequence`.
    ///
    /// # Safety
    ///
    /// `sequence` must be published and the caller's gate must not have
    /// moved past it; the returned slice must be dropped before the gate
    /// advances.
    pub(crate) unsafe fn read(&self, sequence: u64) -> &[u8] {
        let slot = unsafe { &*self.slots[(sequence & self.mask) as usize].get() };
        &slot.data[..slot.len]
    }
}

/// Exclusive write access to one sequence.
///
/// Dropping a claim without publishing leaves the sequence unpublished; the
/// next claim reuses it.
pub struct SlotClaim<'a> {
    ring: &'a RingBuffer,
    _guard: MutexGuard<'a, ()>,
    sequence: u64,
}

impl SlotClaim<'_> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn slot(&mut self) -> &mut Slot {
        // The claim lock is held and every gate is past `sequence - capacity`.
        unsafe { &mut *self.ring.slots[(self.sequence & self.ring.mask) as usize].get() }
    }

    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        let slot_size = self.ring.slot_size;
        if payload.len() > slot_size {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                slot_size,
            });
        }
        let slot = self.slot();
        slot.data[..payload.len()].copy_from_slice(payload);
        slot.len = payload.len();
        Ok(())
    }

    /// Whole slot for in-place encoding; pair with [`SlotClaim::set_len`].
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.slot().data
    }

    pub fn set_len(&mut self, len: usize) -> Result<()> {
        let slot_size = self.ring.slot_size;
        if len > slot_size {
            return Err(Error::PayloadTooLarge { len, slot_size });
        }
        self.slot().len = len;
        Ok(())
    }

    /// Make the slot visible to consumers. Returns its sequence.
    pub fn publish(self) -> u64 {
        self.ring.cursor.store(self.sequence + 1, Ordering::Release);
        self.sequence
    }
}
