use std::{
    ffi::CString,
    io,
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use libc::{c_uint, sem_t, timespec};
use log::warn;

/// A counting semaphore whose waits can be bounded in time, so callers can
/// poll a shutdown flag between attempts.
pub trait CountingSemaphore: Send + Sync {
    /// Takes one unit, waiting at most `timeout`. Returns `false` on timeout.
    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool>;
    fn try_wait(&self) -> io::Result<bool>;
    fn post(&self) -> io::Result<()>;
    fn value(&self) -> io::Result<u32>;
}

/// A POSIX named semaphore (`sem_open`), shared by name between processes.
#[derive(Debug)]
pub struct NamedSemaphore {
    name: String,
    inner: *mut sem_t,
}

impl NamedSemaphore {
    /// Opens `name`, creating it with `initial` units if it does not exist.
    /// An existing semaphore keeps its current count.
    pub fn open_or_create(name: &str, initial: u32) -> io::Result<Self> {
        let c_name = c_name(name)?;
        let inner = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o600 as c_uint,
                initial as c_uint,
            )
        };
        if inner == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            name: name.to_owned(),
            inner,
        })
    }

    /// Removes `name` from the system. Processes that still have it open
    /// keep working on the old object. A missing name is not an error.
    pub fn unlink(name: &str) -> io::Result<()> {
        let c_name = c_name(name)?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl CountingSemaphore for NamedSemaphore {
    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let target = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            + timeout;
        let ts = timespec {
            tv_sec: target.as_secs() as _,
            tv_nsec: target.subsec_nanos() as _,
        };
        loop {
            if unsafe { libc::sem_timedwait(self.inner, &raw const ts) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    fn try_wait(&self) -> io::Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.inner) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.inner) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn value(&self) -> io::Result<u32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.inner, &raw mut value) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value.max(0) as u32)
    }
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_close(self.inner) } != 0 {
            warn!("Closing semaphore {} failed: {}", self.name, io::Error::last_os_error());
        }
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// In-process counting semaphore.
#[derive(Debug, Default)]
pub struct LocalSemaphore {
    count: Mutex<u32>,
    available: Condvar,
}

impl LocalSemaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }
}

impl CountingSemaphore for LocalSemaphore {
    fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut count, _) = self
            .available
            .wait_timeout_while(count, timeout, |c| *c == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        Ok(true)
    }

    fn try_wait(&self) -> io::Result<bool> {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        Ok(true)
    }

    fn post(&self) -> io::Result<()> {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.available.notify_one();
        Ok(())
    }

    fn value(&self) -> io::Result<u32> {
        Ok(*self.count.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn local_wait_times_out_when_empty() {
        let sem = LocalSemaphore::new(0);
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn local_post_wakes_waiter() {
        let sem = Arc::new(LocalSemaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        sem.post().unwrap();
        assert!(waiter.join().unwrap());
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn named_semaphore_counts_across_handles() {
        let name = format!("/chat_test_sem_{}_{}", std::process::id(), rand::random::<u32>());
        let a = NamedSemaphore::open_or_create(&name, 1).unwrap();
        // Second open attaches to the same object; the initial value is ignored.
        let b = NamedSemaphore::open_or_create(&name, 5).unwrap();

        assert_eq!(b.value().unwrap(), 1);
        assert!(b.try_wait().unwrap());
        assert!(!a.try_wait().unwrap());
        assert!(!a.wait_timeout(Duration::from_millis(10)).unwrap());
        a.post().unwrap();
        assert!(b.wait_timeout(Duration::from_millis(10)).unwrap());

        NamedSemaphore::unlink(&name).unwrap();
        NamedSemaphore::unlink(&name).unwrap();
    }
}
