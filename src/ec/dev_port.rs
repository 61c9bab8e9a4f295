use std::{
    fs::{File, OpenOptions, TryLockError},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use log::{debug, info};

use super::{
    EcTimings,
    protocol::{EcProtocol, PortIo},
};

pub const DEV_PORT_PATH: &str = "/dev/port";

/// Port I/O through the kernel's `/dev/port` device, where the file offset
/// is the port number.
///
/// The device is opened and locked exclusively on first use and stays open
/// until [`PortIo::close`].
#[derive(Debug)]
pub struct DevPort {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl DevPort {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_file<T>(&self, op: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        let guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(file) => op(file),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is not open", self.path.display()),
            )),
        }
    }
}

/// Opens `path` read-write and takes an exclusive advisory lock on it.
pub(crate) fn open_exclusive(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("{} is locked by another process", path.display()),
        )),
        Err(TryLockError::Error(e)) => Err(e),
    }
}

impl PortIo for DevPort {
    fn read_port(&self, port: u16) -> io::Result<u8> {
        self.with_file(|file| {
            let mut buf = [0u8; 1];
            file.read_exact_at(&mut buf, u64::from(port))?;
            Ok(buf[0])
        })
    }

    fn write_port(&self, port: u16, value: u8) -> io::Result<()> {
        self.with_file(|file| file.write_all_at(&[value], u64::from(port)))
    }

    fn open(&self) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(open_exclusive(&self.path)?);
            info!("Opened {} for exclusive EC access", self.path.display());
        }
        Ok(())
    }

    fn close(&self) {
        if self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Closed {}", self.path.display());
        }
    }
}

pub fn open_channel(timings: EcTimings) -> io::Result<EcProtocol<DevPort>> {
    let path = Path::new(DEV_PORT_PATH);
    if !path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{DEV_PORT_PATH} does not exist"),
        ));
    }
    Ok(EcProtocol::new("dev_port", DevPort::new(path), timings))
}
