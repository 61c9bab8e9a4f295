use std::{
    fmt, io,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use log::{debug, error, warn};

use super::{BusLock, EcChannel, EcTimings, Transfer, high_register};

/// EC command/status port.
pub const COMMAND_PORT: u16 = 0x66;

/// EC data port.
pub const DATA_PORT: u16 = 0x62;

/// Output buffer full: a byte is waiting on the data port.
pub const STATUS_OBF: u8 = 0x01;

/// Input buffer full: the EC has not consumed the last byte written.
pub const STATUS_IBF: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Read = 0x80,
    Write = 0x81,
}

/// Raw access to the two EC I/O ports.
pub trait PortIo: Send + Sync + 'static {
    fn read_port(&self, port: u16) -> io::Result<u8>;
    fn write_port(&self, port: u16, value: u8) -> io::Result<()>;

    /// Opens the underlying OS handle. Called on every successful bus lock
    /// and must be idempotent.
    fn open(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

/// ACPI EC command handshake over a [`PortIo`] backend.
pub struct EcProtocol<P: PortIo> {
    name: &'static str,
    io: P,
    timings: EcTimings,
    bus: BusLock,
    wait_read_failures: AtomicU32,
    wait_read_disabled: AtomicBool,
}

impl<P: PortIo> fmt::Debug for EcProtocol<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcProtocol")
            .field("name", &self.name)
            .field("timings", &self.timings)
            .field("wait_read_disabled", &self.wait_read_disabled())
            .finish_non_exhaustive()
    }
}

impl<P: PortIo> EcProtocol<P> {
    pub fn new(name: &'static str, io: P, timings: EcTimings) -> Self {
        Self {
            name,
            io,
            timings,
            bus: BusLock::new(),
            wait_read_failures: AtomicU32::new(0),
            wait_read_disabled: AtomicBool::new(false),
        }
    }

    pub fn io(&self) -> &P {
        &self.io
    }

    fn spin_until(&self, ready: impl Fn(u8) -> bool) -> bool {
        for _ in 0..self.timings.wait_spins {
            if self.io.read_port(COMMAND_PORT).is_ok_and(&ready) {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    fn wait_free(&self) -> bool {
        self.spin_until(|status| status & (STATUS_IBF | STATUS_OBF) == 0)
    }

    fn wait_write(&self) -> bool {
        self.spin_until(|status| status & STATUS_IBF == 0)
    }

    fn wait_read(&self) -> bool {
        if self.wait_read_disabled.load(Ordering::Acquire) {
            return true;
        }

        if self.spin_until(|status| status & STATUS_OBF != 0) {
            self.wait_read_failures.store(0, Ordering::Release);
            return true;
        }

        let failures = self.wait_read_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures > self.timings.wait_read_failure_limit
            && !self.wait_read_disabled.swap(true, Ordering::AcqRel)
        {
            warn!(
                "{}: wait-read failed {failures} times in a row, reading without waiting from now on",
                self.name
            );
        }
        false
    }

    fn send(&self, port: u16, value: u8) -> Option<()> {
        self.io
            .write_port(port, value)
            .inspect_err(|e| debug!("{}: port {port:#04x} write failed: {e}", self.name))
            .ok()
    }

    fn try_read_byte(&self, register: u8) -> Option<u8> {
        self.wait_free().then_some(())?;
        self.send(COMMAND_PORT, Command::Read as u8)?;
        self.wait_write().then_some(())?;
        self.send(DATA_PORT, register)?;
        self.wait_write().then_some(())?;
        self.wait_read().then_some(())?;
        self.io.read_port(DATA_PORT).ok()
    }

    fn try_write_byte(&self, register: u8, value: u8) -> Option<()> {
        self.wait_free().then_some(())?;
        self.send(COMMAND_PORT, Command::Write as u8)?;
        self.wait_write().then_some(())?;
        self.send(DATA_PORT, register)?;
        self.wait_write().then_some(())?;
        self.send(DATA_PORT, value)
    }
}

impl<P: PortIo> EcChannel for EcProtocol<P> {
    fn name(&self) -> &str {
        self.name
    }

    fn read_byte(&self, register: u8) -> Transfer<u8> {
        Transfer::retry(self.timings.max_retries, 0, || self.try_read_byte(register))
    }

    fn write_byte(&self, register: u8, value: u8) -> Transfer<()> {
        Transfer::retry(self.timings.max_retries, (), || {
            self.try_write_byte(register, value)
        })
    }

    fn read_word(&self, register: u8) -> Transfer<u16> {
        let Some(high) = high_register(register) else {
            warn!("{}: word read at {register:#04x} has no high byte", self.name);
            return Transfer::failed(0, 0);
        };
        Transfer::retry(self.timings.max_retries, 0, || {
            let lsb = self.try_read_byte(register)?;
            let msb = self.try_read_byte(high)?;
            Some(u16::from_le_bytes([lsb, msb]))
        })
    }

    fn write_word(&self, register: u8, value: u16) -> Transfer<()> {
        let Some(high) = high_register(register) else {
            warn!("{}: word write at {register:#04x} has no high byte", self.name);
            return Transfer::failed((), 0);
        };
        let [lsb, msb] = value.to_le_bytes();
        Transfer::retry(self.timings.max_retries, (), || {
            self.try_write_byte(register, lsb)?;
            self.try_write_byte(high, msb)
        })
    }

    fn acquire_lock(&self, timeout: Duration) -> bool {
        if !self.bus.acquire(timeout) {
            return false;
        }
        match self.io.open() {
            Ok(()) => true,
            Err(e) => {
                error!("{}: cannot open EC device: {e}", self.name);
                self.bus.release();
                false
            }
        }
    }

    fn release_lock(&self) {
        self.bus.release();
    }

    fn wait_read_disabled(&self) -> bool {
        self.wait_read_disabled.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.io.close();
    }
}
