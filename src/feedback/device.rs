//! Destination pool devices.
//!
//! [`LinuxPoolDevice`] talks to `/dev/random` through the `random(4)`
//! ioctls. [`MockPoolDevice`] keeps everything in memory and records each
//! call, which is what tests and dry runs use.
//!
//! Whatever the device, it is wrapped once in a [`SharedPoolDevice`] so
//! every writer goes through the same lock.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Size ceiling of an accounted write request.
pub const MAX_ACCOUNTED_WRITE: usize = 65535;

/// Operations on an OS entropy pool.
pub trait PoolDevice: Send {
    /// Current entropy estimate in bits.
    fn entropy_count(&mut self) -> io::Result<u32>;

    /// Pool capacity in bits.
    fn capacity(&mut self) -> io::Result<u32>;

    /// Mixes `data` into the pool and credits `entropy_bits`.
    fn add_entropy(&mut self, entropy_bits: u32, data: &[u8]) -> io::Result<()>;

    /// Mixes `data` into the pool without crediting entropy.
    fn write_unaccounted(&mut self, data: &[u8]) -> io::Result<()>;

    /// Forces the CSPRNG to reseed from the pool.
    fn reseed(&mut self) -> io::Result<()>;
}

/// Process-wide handle on the destination pool device.
///
/// All clones share one mutex, so writes from different components never
/// interleave.
#[derive(Clone)]
pub struct SharedPoolDevice {
    inner: Arc<Mutex<Box<dyn PoolDevice>>>,
}

impl SharedPoolDevice {
    pub fn new(device: impl PoolDevice + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(device))),
        }
    }

    /// Acquires exclusive access to the device.
    pub fn lock(&self) -> io::Result<MutexGuard<'_, Box<dyn PoolDevice>>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pool device lock poisoned"))
    }
}

impl std::fmt::Debug for SharedPoolDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPoolDevice").finish_non_exhaustive()
    }
}

/// Linux `/dev/random` device.
pub struct LinuxPoolDevice {
    file: File,
    path: PathBuf,
}

/// Kernel pool size reported by procfs.
const POOLSIZE_PATH: &str = "/proc/sys/kernel/random/poolsize";

impl LinuxPoolDevice {
    /// Opens the pool device read-write.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)?;
        tracing::info!(device = %path.display(), "Opened entropy pool device");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod ioctl {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// `_IOR('R', 0x00, int)`
    pub const RNDGETENTCNT: libc::Ioctl = 0x8004_5200u32 as libc::Ioctl;
    /// `_IOW('R', 0x03, int[2])`
    pub const RNDADDENTROPY: libc::Ioctl = 0x4008_5203u32 as libc::Ioctl;
    /// `_IO('R', 0x07)`
    pub const RNDRESEEDCRNG: libc::Ioctl = 0x5207u32 as libc::Ioctl;

    fn check(ret: libc::c_int) -> io::Result<()> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn entropy_count(file: &File) -> io::Result<u32> {
        let mut count: libc::c_int = 0;
        // SAFETY: RNDGETENTCNT writes one int through the pointer.
        check(unsafe { libc::ioctl(file.as_raw_fd(), RNDGETENTCNT, &mut count) })?;
        Ok(count.max(0) as u32)
    }

    pub fn add_entropy(file: &File, entropy_bits: u32, data: &[u8]) -> io::Result<()> {
        // struct rand_pool_info { int entropy_count; int buf_size; __u32 buf[]; }
        let mut request = vec![0u32; 2 + data.len().div_ceil(4)];
        request[0] = entropy_bits.min(i32::MAX as u32);
        request[1] = data.len() as u32;
        for (word, chunk) in request[2..].iter_mut().zip(data.chunks(4)) {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            *word = u32::from_ne_bytes(bytes);
        }
        // SAFETY: the buffer holds the header plus buf_size bytes of payload.
        check(unsafe { libc::ioctl(file.as_raw_fd(), RNDADDENTROPY, request.as_ptr()) })
    }

    pub fn reseed(file: &File) -> io::Result<()> {
        // SAFETY: RNDRESEEDCRNG takes no argument.
        check(unsafe { libc::ioctl(file.as_raw_fd(), RNDRESEEDCRNG) })
    }
}

#[cfg(not(target_os = "linux"))]
mod ioctl {
    use std::fs::File;
    use std::io;

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "entropy pool ioctls require Linux",
        )
    }

    pub fn entropy_count(_file: &File) -> io::Result<u32> {
        Err(unsupported())
    }

    pub fn add_entropy(_file: &File, _entropy_bits: u32, _data: &[u8]) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn reseed(_file: &File) -> io::Result<()> {
        Err(unsupported())
    }
}

impl PoolDevice for LinuxPoolDevice {
    fn entropy_count(&mut self) -> io::Result<u32> {
        ioctl::entropy_count(&self.file)
    }

    fn capacity(&mut self) -> io::Result<u32> {
        let text = std::fs::read_to_string(POOLSIZE_PATH)?;
        text.trim()
            .parse::<u32>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn add_entropy(&mut self, entropy_bits: u32, data: &[u8]) -> io::Result<()> {
        if data.len() > MAX_ACCOUNTED_WRITE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accounted write exceeds 65535 bytes",
            ));
        }
        ioctl::add_entropy(&self.file, entropy_bits, data)
    }

    fn write_unaccounted(&mut self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.file.write_all(data)
    }

    fn reseed(&mut self) -> io::Result<()> {
        ioctl::reseed(&self.file)
    }
}

/// A call observed by [`MockPoolDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    EntropyCount,
    AddEntropy { bits: u32, len: usize },
    WriteUnaccounted { len: usize },
    Reseed,
}

#[derive(Debug)]
struct MockState {
    count: u32,
    capacity: u32,
    calls: Vec<DeviceCall>,
    fail_writes: bool,
}

/// In-memory pool device.
///
/// Accounted writes raise the simulated estimate (saturating at capacity).
/// Clones observe the same state.
#[derive(Debug, Clone)]
pub struct MockPoolDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockPoolDevice {
    /// Creates a device reporting `count` bits out of `capacity`.
    pub fn new(count: u32, capacity: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                count: count.min(capacity),
                capacity,
                calls: Vec::new(),
                fail_writes: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A poisoned mock only happens after a panicking test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes subsequent writes and reseeds fail with a permission error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Overrides the simulated estimate.
    pub fn set_count(&self, count: u32) {
        let mut state = self.state();
        state.count = count.min(state.capacity);
    }

    pub fn count(&self) -> u32 {
        self.state().count
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state().calls.clone()
    }

    /// Calls that modified the pool.
    pub fn write_calls(&self) -> Vec<DeviceCall> {
        self.calls()
            .into_iter()
            .filter(|c| *c != DeviceCall::EntropyCount)
            .collect()
    }

    pub fn reseed_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == DeviceCall::Reseed)
            .count()
    }

    fn check_writable(state: &MockState) -> io::Result<()> {
        if state.fail_writes {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ))
        } else {
            Ok(())
        }
    }
}

impl PoolDevice for MockPoolDevice {
    fn entropy_count(&mut self) -> io::Result<u32> {
        let mut state = self.state();
        state.calls.push(DeviceCall::EntropyCount);
        Ok(state.count)
    }

    fn capacity(&mut self) -> io::Result<u32> {
        Ok(self.state().capacity)
    }

    fn add_entropy(&mut self, entropy_bits: u32, data: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(DeviceCall::AddEntropy {
            bits: entropy_bits,
            len: data.len(),
        });
        Self::check_writable(&state)?;
        state.count = state.count.saturating_add(entropy_bits).min(state.capacity);
        Ok(())
    }

    fn write_unaccounted(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        state
            .calls
            .push(DeviceCall::WriteUnaccounted { len: data.len() });
        Self::check_writable(&state)
    }

    fn reseed(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Reseed);
        Self::check_writable(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_random_ioctl_request_codes() {
        assert_eq!(ioctl::RNDGETENTCNT as u32, 0x8004_5200);
        assert_eq!(ioctl::RNDADDENTROPY as u32, 0x4008_5203);
        assert_eq!(ioctl::RNDRESEEDCRNG as u32, 0x5207);
    }

    #[test]
    fn test_mock_device_accounting() {
        let mock = MockPoolDevice::new(50, 256);
        let shared = SharedPoolDevice::new(mock.clone());

        shared.lock().unwrap().add_entropy(100, &[0u8; 13]).unwrap();
        assert_eq!(mock.count(), 150);

        shared.lock().unwrap().add_entropy(500, &[0u8; 63]).unwrap();
        assert_eq!(mock.count(), 256);
    }

    #[test]
    fn test_mock_device_failure_injection() {
        let mut mock = MockPoolDevice::new(0, 256);
        mock.set_fail_writes(true);

        let err = mock.add_entropy(8, &[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(mock.count(), 0);
        assert!(mock.reseed().is_err());
    }

    #[test]
    fn test_mock_records_calls() {
        let mut mock = MockPoolDevice::new(0, 256);
        mock.entropy_count().unwrap();
        mock.write_unaccounted(&[0u8; 4]).unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                DeviceCall::EntropyCount,
                DeviceCall::WriteUnaccounted { len: 4 }
            ]
        );
        assert_eq!(mock.write_calls().len(), 1);
    }
}
