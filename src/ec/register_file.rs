//! Channels over kernel-provided EC register files.
//!
//! The kernel driver performs the ACPI handshake itself, so these channels
//! only map register addresses to file offsets. Wait-read degradation does
//! not apply.

use std::{
    fmt,
    fs::File,
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use log::{debug, error, info};

use super::{BusLock, EcChannel, EcTimings, Transfer, dev_port::open_exclusive, high_register};

pub const EC_SYS_PATH: &str = "/sys/kernel/debug/ec/ec0/io";
pub const ACPI_EC_PATH: &str = "/dev/ec";

pub struct RegisterFileChannel {
    name: &'static str,
    path: PathBuf,
    timings: EcTimings,
    bus: BusLock,
    file: Mutex<Option<File>>,
}

impl fmt::Debug for RegisterFileChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterFileChannel")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RegisterFileChannel {
    pub fn new(name: &'static str, path: impl Into<PathBuf>, timings: EcTimings) -> Self {
        Self {
            name,
            path: path.into(),
            timings,
            bus: BusLock::new(),
            file: Mutex::new(None),
        }
    }

    /// Builds a channel if `path` exists.
    pub fn open(name: &'static str, path: &str, timings: EcTimings) -> io::Result<Self> {
        if !Path::new(path).exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{path} does not exist"),
            ));
        }
        Ok(Self::new(name, path, timings))
    }

    fn try_read(&self, register: u8) -> Option<u8> {
        let guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buf = [0u8; 1];
        guard
            .as_ref()?
            .read_exact_at(&mut buf, u64::from(register))
            .inspect_err(|e| debug!("{}: read {register:#04x} failed: {e}", self.name))
            .ok()?;
        Some(buf[0])
    }

    fn try_write(&self, register: u8, value: u8) -> Option<()> {
        let guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()?
            .write_all_at(&[value], u64::from(register))
            .inspect_err(|e| debug!("{}: write {register:#04x} failed: {e}", self.name))
            .ok()
    }
}

impl EcChannel for RegisterFileChannel {
    fn name(&self) -> &str {
        self.name
    }

    fn read_byte(&self, register: u8) -> Transfer<u8> {
        Transfer::retry(self.timings.max_retries, 0, || self.try_read(register))
    }

    fn write_byte(&self, register: u8, value: u8) -> Transfer<()> {
        Transfer::retry(self.timings.max_retries, (), || self.try_write(register, value))
    }

    fn read_word(&self, register: u8) -> Transfer<u16> {
        let Some(high) = high_register(register) else {
            return Transfer::failed(0, 0);
        };
        Transfer::retry(self.timings.max_retries, 0, || {
            Some(u16::from_le_bytes([self.try_read(register)?, self.try_read(high)?]))
        })
    }

    fn write_word(&self, register: u8, value: u16) -> Transfer<()> {
        let Some(high) = high_register(register) else {
            return Transfer::failed((), 0);
        };
        let [lsb, msb] = value.to_le_bytes();
        Transfer::retry(self.timings.max_retries, (), || {
            self.try_write(register, lsb)?;
            self.try_write(high, msb)
        })
    }

    fn acquire_lock(&self, timeout: Duration) -> bool {
        if !self.bus.acquire(timeout) {
            return false;
        }

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if file.is_some() {
            return true;
        }
        match open_exclusive(&self.path) {
            Ok(handle) => {
                info!("{}: opened {}", self.name, self.path.display());
                *file = Some(handle);
                true
            }
            Err(e) => {
                error!("{}: cannot open {}: {e}", self.name, self.path.display());
                drop(file);
                self.bus.release();
                false
            }
        }
    }

    fn release_lock(&self) {
        self.bus.release();
    }

    fn dispose(&self) {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
