use std::{
    io,
    mem::MaybeUninit,
    os::fd::OwnedFd,
    ptr::null_mut,
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::Duration,
};

use rustix::{
    fs::{fstat, ftruncate, Mode},
    io::Errno,
    mm::{mmap, munmap, MapFlags, ProtFlags},
    shm::{self, OFlags},
};

use crate::MAGIC_VALUE;

const JOIN_ATTEMPTS: u32 = 50;
const JOIN_BACKOFF: Duration = Duration::from_millis(10);

/// Marker for types that may be placed in memory shared between processes:
/// no pointers, no heap ownership, valid when all-zero.
pub unsafe trait ShmSafe {}

/// A named POSIX shared memory segment holding one `T`.
///
/// The segment starts with a magic word that the creating process publishes
/// only after `T` has been initialized. Joiners never initialize anything.
pub struct SharedMemory<T> {
    descriptor: String,
    memory: *mut SharedMemoryContents<T>,
}

impl<T: ShmSafe> SharedMemory<T> {
    /// Creates the segment if it does not exist, otherwise attaches to it.
    /// `init` runs only in the creating process, before the segment is
    /// published. Returns whether this call created the segment.
    pub fn open_or_create(
        descriptor: impl Into<String>,
        init: impl FnOnce(&mut MaybeUninit<T>) -> io::Result<()>,
    ) -> io::Result<(Self, bool)> {
        let descriptor = descriptor.into();

        match shm::open(
            &descriptor,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => {
                let mem = Self::create(descriptor.clone(), fd, init);
                if mem.is_err() {
                    let _ = shm::unlink(&descriptor);
                }
                Ok((mem?, true))
            }
            Err(Errno::EXIST) => Ok((Self::join(descriptor)?, false)),
            Err(e) => Err(e.into()),
        }
    }

    /// Attaches to an existing segment without creating it. `Ok(None)` if
    /// there is no such segment.
    pub fn open_existing(descriptor: impl Into<String>) -> io::Result<Option<Self>> {
        let descriptor = descriptor.into();
        match Self::join(descriptor) {
            Ok(mem) => Ok(Some(mem)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create(
        descriptor: String,
        fd: OwnedFd,
        init: impl FnOnce(&mut MaybeUninit<T>) -> io::Result<()>,
    ) -> io::Result<Self> {
        ftruncate(&fd, size_of::<SharedMemoryContents<T>>() as u64)?;
        let ptr = unsafe { Self::mmap(&fd)? };
        let mem = Self {
            descriptor,
            memory: ptr,
        };

        unsafe {
            let contents = &mut (*ptr).contents;
            init(contents)?;
            (*ptr).magic.store(MAGIC_VALUE, Ordering::Release);
        }

        Ok(mem)
    }

    fn join(descriptor: String) -> io::Result<Self> {
        let fd = shm::open(&descriptor, OFlags::RDWR, Mode::RUSR | Mode::WUSR)?;

        // The creator may not have sized the segment yet; touching pages
        // past the end would fault.
        let needed = size_of::<SharedMemoryContents<T>>() as i64;
        let mut attempts = 0;
        while (fstat(&fd)?.st_size as i64) < needed {
            attempts += 1;
            if attempts > JOIN_ATTEMPTS {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{descriptor} has the wrong size"),
                ));
            }
            thread::sleep(JOIN_BACKOFF);
        }

        let ptr = unsafe { Self::mmap(&fd)? };
        let mem = Self {
            descriptor,
            memory: ptr,
        };

        let mut attempts = 0;
        while !mem.is_ready() {
            attempts += 1;
            if attempts > JOIN_ATTEMPTS {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("{} not ready yet", mem.descriptor),
                ));
            }
            thread::sleep(JOIN_BACKOFF);
        }

        Ok(mem)
    }

    pub fn is_ready(&self) -> bool {
        unsafe { (*self.memory).magic.load(Ordering::Acquire) == MAGIC_VALUE }
    }

    pub fn get(&self) -> &T {
        unsafe { (*self.memory).contents.assume_init_ref() }
    }

    unsafe fn mmap(fd: &OwnedFd) -> io::Result<*mut SharedMemoryContents<T>> {
        // Safety: Ptr is null
        Ok(mmap(
            null_mut(),
            size_of::<SharedMemoryContents<T>>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
        .cast())
    }
}

/// Removes the segment name. Mappings held by running processes stay valid.
pub fn unlink(descriptor: &str) -> io::Result<()> {
    match shm::unlink(descriptor) {
        Ok(()) | Err(Errno::NOENT) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl<T> Drop for SharedMemory<T> {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.memory.cast(), size_of::<SharedMemoryContents<T>>());
        }
    }
}

unsafe impl<T: Send> Send for SharedMemory<T> {}
unsafe impl<T: Sync> Sync for SharedMemory<T> {}

#[repr(C)]
pub struct SharedMemoryContents<T> {
    magic: AtomicU32,
    contents: MaybeUninit<T>,
}
