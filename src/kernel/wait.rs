//! Waiting for an object that another thread is using.
//!
//! The table lock is released between checks. After every relock the object
//! is looked up again by unique ID, so a handle that was destroyed and
//! reused while we slept is reported as signalled rather than silently
//! picked up.

use std::sync::MutexGuard;
use std::thread;
use std::time::Duration;

use super::{Kernel, KernelState};
use crate::error::{KernelError, KernelResult};
use crate::types::ObjectRef;

/// Exponential backoff between checks, without jitter.
pub(crate) struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(self.attempt).unwrap_or(u64::MAX));
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(exp.min(self.max_ms))
    }
}

impl Kernel {
    /// Block until `object` is free or in use by this thread.
    ///
    /// With `capped` the wait gives up with [`KernelError::Timeout`] after the
    /// configured number of iterations.
    pub(crate) fn wait_for_object<'a>(
        &'a self,
        mut state: MutexGuard<'a, KernelState>,
        object: ObjectRef,
        capped: bool,
    ) -> KernelResult<MutexGuard<'a, KernelState>> {
        let mut backoff = Backoff::new(1, self.config.wait_sleep_cap_ms);
        let mut iterations = 0u32;
        loop {
            let record = state
                .table
                .get_ref(object)
                .ok_or(KernelError::Signalled)?;
            if !record.busy_elsewhere() {
                return Ok(state);
            }
            if capped && iterations >= self.config.wait_max_iterations {
                log::warn!("timed out waiting for {} after {iterations} checks", object.handle);
                return Err(KernelError::Timeout);
            }
            drop(state);
            if iterations < self.config.wait_spin_count {
                thread::yield_now();
            } else {
                thread::sleep(backoff.next_delay());
            }
            iterations += 1;
            state = self.lock_state();
        }
    }
}
