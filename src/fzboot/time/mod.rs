//! Time related utilities.
//!
//! Interrupt controller bring-up happens before any scheduler exists, so every wait in this crate is a busy wait.
//! The clock backing those waits (`TSC`, `HPET`, `PIT`, ...) is provided by the kernel through [`WaitTimer`].

use core::time::Duration;

/// Busy-wait service.
pub trait WaitTimer: Sync {
    /// Spins for at least `duration`.
    fn busy_wait(&self, duration: Duration);
}

/// Waits until a condition is satisfied, or a timeout is reached.
///
/// The condition is checked up to `attempts` times, with a wait of `interval` after each unsuccessful check.
/// Returns `true` as soon as the condition holds, and `false` if it never did.
///
/// # Examples
///
/// ```ignore
/// use core::time::Duration;
/// use fzkernel::time::wait_for;
///
/// let ready = wait_for(timer, Duration::from_millis(10), 10, || device_ready());
/// ```
pub fn wait_for(
    timer: &dyn WaitTimer,
    interval: Duration,
    attempts: u32,
    mut cond: impl FnMut() -> bool,
) -> bool {
    for _ in 0..attempts {
        if cond() {
            return true;
        }
        timer.busy_wait(interval);
    }

    cond()
}
