//! Embedded Controller bus access.
//!
//! Every fan write and register read in the daemon goes through an
//! [`EcChannel`]. One channel exists per machine; its [`BusLock`] is the only
//! thing that serializes access to the physical bus, across fans, ticks and
//! manual requests alike.

pub mod dev_port;
pub mod protocol;
pub mod register_file;

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Result of a single byte or word transfer.
///
/// Transient hardware faults are expected and frequent, so they are reported
/// as values instead of errors. A failed transfer carries a zero value and
/// the number of attempts that were made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer<T> {
    pub value: T,
    pub attempts: u8,
    pub completed: bool,
}

impl<T> Transfer<T> {
    pub const fn completed(value: T, attempts: u8) -> Self {
        Self {
            value,
            attempts,
            completed: true,
        }
    }

    pub const fn failed(value: T, attempts: u8) -> Self {
        Self {
            value,
            attempts,
            completed: false,
        }
    }

    /// Runs `op` until it succeeds or `max_retries` attempts were made.
    ///
    /// A bound of zero still performs one attempt.
    pub fn retry(max_retries: u8, fallback: T, mut op: impl FnMut() -> Option<T>) -> Self {
        let bound = max_retries.max(1);
        for attempt in 1..=bound {
            if let Some(value) = op() {
                return Self::completed(value, attempt);
            }
        }
        Self::failed(fallback, bound)
    }
}

/// Timing and retry knobs shared by every channel implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcTimings {
    /// Attempts per byte or word operation.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u8,

    /// Status polls per spin-wait before the wait is considered failed.
    #[serde(default = "defaults::wait_spins")]
    pub wait_spins: u32,

    /// Consecutive wait-read failures tolerated before the wait-read step
    /// is skipped for the rest of the channel's lifetime.
    #[serde(default = "defaults::wait_read_failure_limit")]
    pub wait_read_failure_limit: u32,
}

impl Default for EcTimings {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            wait_spins: defaults::wait_spins(),
            wait_read_failure_limit: defaults::wait_read_failure_limit(),
        }
    }
}

mod defaults {
    pub fn max_retries() -> u8 {
        5
    }

    pub fn wait_spins() -> u32 {
        1000
    }

    pub fn wait_read_failure_limit() -> u32 {
        20
    }
}

/// Register-level access to the Embedded Controller.
///
/// Implementations are selected once at startup by the driver registry
/// (see [`crate::drivers`]) and shared behind an `Arc`. Callers must hold the
/// bus lock around every sequence of operations; the lock is not reentrant.
///
/// # Example
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
/// use ecfand::ec::{BusGuard, EcChannel};
///
/// fn bump(channel: Arc<dyn EcChannel>) {
///     if let Some(bus) = BusGuard::acquire(channel, Duration::from_millis(200)) {
///         let current = bus.read_byte(0x2F).value;
///         bus.write_byte(0x2F, current.saturating_add(1));
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait EcChannel: Send + Sync + fmt::Debug {
    /// Registry name of the driver backing this channel.
    fn name(&self) -> &str;

    fn read_byte(&self, register: u8) -> Transfer<u8>;

    fn write_byte(&self, register: u8, value: u8) -> Transfer<()>;

    /// Reads `register` (low byte) and `register + 1` (high byte).
    fn read_word(&self, register: u8) -> Transfer<u16>;

    /// Writes the low byte to `register` and the high byte to `register + 1`.
    fn write_word(&self, register: u8, value: u16) -> Transfer<()>;

    /// Takes the bus lock, giving up with `false` once `timeout` elapses.
    fn acquire_lock(&self, timeout: Duration) -> bool;

    fn release_lock(&self);

    /// Whether the wait-read spin has been switched off after repeated
    /// failures. Reads are then taken without waiting for the EC.
    fn wait_read_disabled(&self) -> bool {
        false
    }

    /// Closes any OS handle held by the channel.
    fn dispose(&self) {}
}

/// Process-wide mutual exclusion for one EC bus.
///
/// Unlike a `Mutex` guard, acquisition and release are separate calls so the
/// lock can be held across the steps of a poll tick that run on different
/// threads.
#[derive(Debug, Default)]
pub struct BusLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl BusLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, timeout: Duration) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut held, _) = self
            .released
            .wait_timeout_while(held, timeout, |held| *held)
            .unwrap_or_else(PoisonError::into_inner);

        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    pub fn release(&self) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.released.notify_one();
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bus lock held on behalf of a caller; released on drop.
#[derive(Debug)]
pub struct BusGuard {
    channel: Arc<dyn EcChannel>,
}

impl BusGuard {
    pub fn acquire(channel: Arc<dyn EcChannel>, timeout: Duration) -> Option<Self> {
        channel.acquire_lock(timeout).then(|| Self { channel })
    }
}

impl std::ops::Deref for BusGuard {
    type Target = dyn EcChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        self.channel.release_lock();
    }
}

/// Register address of the high byte of a word at `register`.
pub(crate) fn high_register(register: u8) -> Option<u8> {
    register.checked_add(1)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Register file in memory that records every write.
    #[derive(Debug)]
    pub(crate) struct MemoryChannel {
        registers: Mutex<[u8; 256]>,
        writes: Mutex<Vec<(u8, u8)>>,
        bus: BusLock,
        failing: AtomicBool,
        degraded: AtomicBool,
        disposed: AtomicBool,
    }

    impl MemoryChannel {
        pub(crate) fn new() -> Self {
            Self {
                registers: Mutex::new([0; 256]),
                writes: Mutex::new(Vec::new()),
                bus: BusLock::new(),
                failing: AtomicBool::new(false),
                degraded: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }
        }

        pub(crate) fn get(&self, register: u8) -> u8 {
            self.registers.lock().unwrap()[register as usize]
        }

        pub(crate) fn set(&self, register: u8, value: u8) {
            self.registers.lock().unwrap()[register as usize] = value;
        }

        pub(crate) fn writes(&self) -> Vec<(u8, u8)> {
            self.writes.lock().unwrap().clone()
        }

        pub(crate) fn clear_writes(&self) {
            self.writes.lock().unwrap().clear();
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub(crate) fn set_degraded(&self) {
            self.degraded.store(true, Ordering::SeqCst);
        }

        pub(crate) fn bus(&self) -> &BusLock {
            &self.bus
        }

        pub(crate) fn is_disposed(&self) -> bool {
            self.disposed.load(Ordering::SeqCst)
        }

        fn fails(&self) -> bool {
            self.failing.load(Ordering::SeqCst)
        }
    }

    impl EcChannel for MemoryChannel {
        fn name(&self) -> &str {
            "memory"
        }

        fn read_byte(&self, register: u8) -> Transfer<u8> {
            if self.fails() {
                return Transfer::failed(0, 5);
            }
            Transfer::completed(self.get(register), 1)
        }

        fn write_byte(&self, register: u8, value: u8) -> Transfer<()> {
            if self.fails() {
                return Transfer::failed((), 5);
            }
            self.set(register, value);
            self.writes.lock().unwrap().push((register, value));
            Transfer::completed((), 1)
        }

        fn read_word(&self, register: u8) -> Transfer<u16> {
            let Some(high) = high_register(register) else {
                return Transfer::failed(0, 0);
            };
            if self.fails() {
                return Transfer::failed(0, 5);
            }
            Transfer::completed(u16::from_le_bytes([self.get(register), self.get(high)]), 1)
        }

        fn write_word(&self, register: u8, value: u16) -> Transfer<()> {
            let Some(high) = high_register(register) else {
                return Transfer::failed((), 0);
            };
            let [lsb, msb] = value.to_le_bytes();
            let low = self.write_byte(register, lsb);
            if !low.completed {
                return low;
            }
            self.write_byte(high, msb)
        }

        fn acquire_lock(&self, timeout: Duration) -> bool {
            self.bus.acquire(timeout)
        }

        fn release_lock(&self) {
            self.bus.release();
        }

        fn wait_read_disabled(&self) -> bool {
            self.degraded.load(Ordering::SeqCst)
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Instant,
    };

    #[test]
    fn retry_stops_at_first_success() {
        let mut calls = 0;
        let transfer = Transfer::retry(5, 0u8, || {
            calls += 1;
            (calls == 3).then_some(42)
        });

        assert_eq!(transfer, Transfer::completed(42, 3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_gives_up_after_bound() {
        let mut calls = 0;
        let transfer = Transfer::retry(7, 0u16, || {
            calls += 1;
            None
        });

        assert_eq!(transfer, Transfer::failed(0, 7));
        assert_eq!(calls, 7);
    }

    #[test]
    fn retry_with_zero_bound_still_tries_once() {
        let mut calls = 0;
        let transfer = Transfer::retry(0, (), || {
            calls += 1;
            None
        });

        assert!(!transfer.completed);
        assert_eq!(calls, 1);
    }

    #[test]
    fn timings_default_values() {
        let timings = EcTimings::default();
        assert_eq!(timings.max_retries, 5);
        assert_eq!(timings.wait_spins, 1000);
        assert_eq!(timings.wait_read_failure_limit, 20);
    }

    #[test]
    fn bus_lock_second_acquire_times_out() {
        let lock = BusLock::new();
        assert!(lock.acquire(Duration::from_millis(10)));

        let started = Instant::now();
        assert!(!lock.acquire(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn bus_lock_concurrent_acquire_waits_for_release() {
        let lock = Arc::new(BusLock::new());
        assert!(lock.acquire(Duration::from_millis(10)));

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let lock = lock.clone();
            let released = released.clone();
            thread::spawn(move || {
                let acquired = lock.acquire(Duration::from_secs(5));
                (acquired, released.load(Ordering::SeqCst))
            })
        };

        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        lock.release();

        let (acquired, after_release) = waiter.join().unwrap();
        assert!(acquired);
        assert!(after_release);
        assert!(lock.is_held());
    }

    #[test]
    fn bus_lock_only_one_of_two_racing_callers_wins() {
        let lock = Arc::new(BusLock::new());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || lock.acquire(Duration::from_millis(50)))
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn bus_guard_releases_on_drop() {
        let mut channel = MockEcChannel::new();
        channel.expect_acquire_lock().times(1).return_const(true);
        channel.expect_release_lock().times(1).return_const(());

        let guard = BusGuard::acquire(Arc::new(channel), Duration::from_millis(10));
        assert!(guard.is_some());
        drop(guard);
    }

    #[test]
    fn bus_guard_none_when_lock_busy() {
        let mut channel = MockEcChannel::new();
        channel.expect_acquire_lock().times(1).return_const(false);
        channel.expect_release_lock().never();

        assert!(BusGuard::acquire(Arc::new(channel), Duration::from_millis(10)).is_none());
    }

    #[test]
    fn failed_guard_leaves_holder_lock_alone() {
        let channel = Arc::new(testing::MemoryChannel::new());
        let holder = BusGuard::acquire(channel.clone(), Duration::from_millis(10));
        assert!(holder.is_some());

        assert!(BusGuard::acquire(channel.clone(), Duration::from_millis(10)).is_none());
        assert!(channel.bus().is_held());
        assert!(BusGuard::acquire(channel.clone(), Duration::from_millis(10)).is_none());

        drop(holder);
        assert!(!channel.bus().is_held());
        assert!(BusGuard::acquire(channel, Duration::from_millis(10)).is_some());
    }

    #[test]
    fn high_register_rejects_last_address() {
        assert_eq!(high_register(0x10), Some(0x11));
        assert_eq!(high_register(0xFF), None);
    }
}
