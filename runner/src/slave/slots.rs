use crate::protocol::JobId;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("a job needs at least one slot")]
    ZeroSlots,
    #[error("only {free} of {requested} requested slots are free")]
    Exhausted { free: u32, requested: u32 },
    #[error("job {0} already holds slots")]
    AlreadyHeld(JobId),
}

/// Fixed pool of compute slots
///
/// Slots are accounted per job: a job reserves once and releases once, a second release
/// of the same job is a no-op. `free` therefore always stays within `0..=total`.
#[derive(Debug)]
pub struct SlotPool {
    total: u32,
    free: u32,
    held: HashMap<JobId, u32>,
}

impl SlotPool {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            free: total,
            held: HashMap::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn free(&self) -> u32 {
        self.free
    }

    pub fn jobs(&self) -> usize {
        self.held.len()
    }

    pub fn reserve(&mut self, job_id: JobId, slots: u32) -> Result<(), SlotError> {
        if slots == 0 {
            return Err(SlotError::ZeroSlots);
        }
        if self.held.contains_key(&job_id) {
            return Err(SlotError::AlreadyHeld(job_id));
        }
        if self.free < slots {
            return Err(SlotError::Exhausted {
                free: self.free,
                requested: slots,
            });
        }

        self.free -= slots;
        self.held.insert(job_id, slots);

        Ok(())
    }

    /// Return the slots held by `job_id`, `None` if it holds none (already released)
    pub fn release(&mut self, job_id: &JobId) -> Option<u32> {
        let slots = self.held.remove(job_id)?;
        self.free += slots;
        debug_assert!(self.free <= self.total);

        Some(slots)
    }
}
