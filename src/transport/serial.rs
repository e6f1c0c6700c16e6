//! Serial device access shared by the framed, RFCOMM and line adapters.
//!
//! The adapters talk to a [`SerialLink`] rather than to `serialport`
//! directly so the simulator can stand in for real hardware.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::telegram::ByteSource;

use super::{LinkCounters, TransportError};

/// One open serial (or RFCOMM) device handle.
pub trait SerialLink: ByteSource + Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// A second handle onto the same device, used to read and write from
    /// different workers.
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;

    /// Cheap liveness probe.
    fn probe(&mut self) -> bool;
}

/// Opens serial devices by path.
pub trait SerialOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError>;

    /// Device paths whose node name starts with one of `patterns`, in
    /// pattern order.
    fn ports(&self, patterns: &[String]) -> Vec<String>;

    /// First port matching `patterns`.
    fn detect(&self, patterns: &[String]) -> Option<String> {
        self.ports(patterns).into_iter().next()
    }
}

/// [`SerialOpener`] backed by the operating system's serial ports.
#[derive(Debug, Clone)]
pub struct SystemSerial {
    read_timeout: Duration,
    device_dir: PathBuf,
}

impl SystemSerial {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            device_dir: PathBuf::from("/dev"),
        }
    }

    pub fn with_device_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.device_dir = dir.into();
        self
    }
}

impl SerialOpener for SystemSerial {
    fn ports(&self, patterns: &[String]) -> Vec<String> {
        matching_ports(&self.device_dir, patterns)
            .into_iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect()
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()
            .map_err(|e| TransportError::Io(io::Error::from(e)))?;
        log::debug!("Opened serial device {} at {} baud", path, baud_rate);
        Ok(Box::new(PortLink(port)))
    }
}

struct PortLink(Box<dyn serialport::SerialPort>);

impl ByteSource for PortLink {
    fn available(&mut self) -> io::Result<usize> {
        Ok(self.0.bytes_to_read()? as usize)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl SerialLink for PortLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.0, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.0)
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(PortLink(self.0.try_clone()?)))
    }

    fn probe(&mut self) -> bool {
        self.0.bytes_to_read().is_ok()
    }
}

/// A serial handle shared between the adapter and its blocking workers.
pub(crate) type SharedLink = Arc<Mutex<Option<Box<dyn SerialLink>>>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded retry for outbound writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(20),
        }
    }
}

/// Write `data` with up to `policy.attempts` tries. After the last failure
/// the link is marked dead so the relay reconnects instead of retrying.
///
/// Blocking: call from the blocking pool.
pub(crate) fn write_with_retry(
    link: &SharedLink,
    data: &[u8],
    policy: WritePolicy,
    alive: &AtomicBool,
    counters: &LinkCounters,
) -> Result<(), TransportError> {
    let attempts = policy.attempts.max(1);
    let mut last = String::new();

    for attempt in 1..=attempts {
        let result = {
            let mut guard = lock(link);
            let port = guard.as_mut().ok_or(TransportError::NotConnected)?;
            port.write_all(data).and_then(|()| port.flush())
        };
        match result {
            Ok(()) => {
                counters.record_sent(data.len());
                return Ok(());
            }
            Err(e) => {
                counters.record_error();
                log::warn!("Write error (attempt {}/{}): {}", attempt, attempts, e);
                last = e.to_string();
                if attempt < attempts {
                    thread::sleep(policy.delay);
                }
            }
        }
    }

    log::error!("Write failed after {} attempts", attempts);
    alive.store(false, Ordering::SeqCst);
    Err(TransportError::WriteFailed { attempts, last })
}

/// Device nodes in `dir` whose file name starts with one of `patterns`,
/// in pattern order, then name order.
pub fn matching_ports(dir: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(e) => {
            log::debug!("Cannot list {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    names.sort();

    let mut found = Vec::new();
    for pattern in patterns {
        for name in &names {
            let path = dir.join(name);
            if name.starts_with(pattern.as_str()) && !found.contains(&path) {
                found.push(path);
            }
        }
    }
    found
}

/// Display name for a device node: `/dev/cu.NXT-DevB` becomes `NXT-DevB`.
pub fn device_display_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    for prefix in ["cu.", "tty."] {
        if let Some(rest) = file.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimSerialHub;

    #[test]
    fn test_write_retry_stops_after_three_attempts() {
        let hub = SimSerialHub::new();
        hub.fail_writes(true);
        let link: SharedLink = Arc::new(Mutex::new(Some(hub.link())));
        let alive = AtomicBool::new(true);
        let counters = LinkCounters::default();
        let policy = WritePolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        };

        let result = write_with_retry(&link, &[0x02, 0x00, 0x00, 0x0B], policy, &alive, &counters);

        assert!(matches!(result, Err(TransportError::WriteFailed { attempts: 3, .. })));
        assert_eq!(hub.write_attempts(), 3);
        assert!(!alive.load(Ordering::SeqCst));
        assert_eq!(counters.snapshot().errors, 3);
    }

    #[test]
    fn test_write_succeeds_first_try() {
        let hub = SimSerialHub::new();
        let link: SharedLink = Arc::new(Mutex::new(Some(hub.link())));
        let alive = AtomicBool::new(true);
        let counters = LinkCounters::default();

        write_with_retry(&link, &[1, 2, 3], WritePolicy::default(), &alive, &counters).unwrap();

        assert_eq!(hub.written(), vec![1, 2, 3]);
        assert_eq!(hub.write_attempts(), 1);
        assert!(alive.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_without_link_is_not_connected() {
        let link: SharedLink = Arc::new(Mutex::new(None));
        let result = write_with_retry(
            &link,
            &[1],
            WritePolicy::default(),
            &AtomicBool::new(true),
            &LinkCounters::default(),
        );
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_port_detection_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB0", "cu.NXT", "tty.NXT-DevB", "ttyS0"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let patterns: Vec<String> =
            ["cu.NXT", "tty.NXT", "ttyUSB"].iter().map(|s| s.to_string()).collect();

        let found = matching_ports(dir.path(), &patterns);
        let names: Vec<String> = found.iter().map(|p| device_display_name(p)).collect();
        assert_eq!(names, vec!["NXT", "NXT-DevB", "ttyUSB0"]);

        let opener = SystemSerial::new(Duration::from_secs(1)).with_device_dir(dir.path());
        let first = opener.detect(&patterns).unwrap();
        assert!(first.ends_with("cu.NXT"));
        assert_eq!(opener.ports(&patterns).len(), 3);
    }

    #[test]
    fn test_missing_directory_yields_nothing() {
        let patterns = vec!["rfcomm".to_string()];
        assert!(matching_ports(Path::new("/nonexistent/devices"), &patterns).is_empty());
    }
}
