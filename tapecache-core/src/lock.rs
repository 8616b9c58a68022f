use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use fs2::FileExt;

use crate::error::{Result, TapeError};

/// Exclusive advisory lock on a cache file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Locks a clone of `file`, retrying briefly while another handle holds it.
    pub fn try_exclusive(file: &File, path: &Path) -> Result<Self> {
        const MAX_ATTEMPTS: u32 = 20; // ~1 second with 50ms backoff
        const BACKOFF: Duration = Duration::from_millis(50);

        let clone = file.try_clone()?;
        let mut attempts = 0;
        loop {
            match clone.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file: clone }),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if attempts >= MAX_ATTEMPTS {
                        return Err(TapeError::Lock(format!(
                            "{} is in use by another cache",
                            path.display()
                        )));
                    }
                    attempts += 1;
                    thread::sleep(BACKOFF);
                }
                Err(err) => return Err(TapeError::Lock(err.to_string())),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Locks an in-process mutex, ignoring poisoning left behind by a panicked job.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
