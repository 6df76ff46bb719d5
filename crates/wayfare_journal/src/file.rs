//! File-based journal backend.

use crate::backend::JournalBackend;
use crate::error::{JournalError, JournalResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based journal backend.
///
/// The file is exclusively locked for the lifetime of the backend so two
/// processes can never drive the same sync ledger.
///
/// # Durability
///
/// - `sync()` calls `File::sync_all()`
/// - `replace()` writes a sibling `.tmp` file, syncs it and renames it over
///   the journal, so a crash leaves either the old or the new contents
///
/// # Example
///
/// ```no_run
/// use wayfare_journal::{FileBackend, JournalBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("sync.journal")).unwrap();
/// backend.append(b"frame").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileBackend {
    /// Opens or creates the journal file and takes an exclusive lock on it.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Locked`] if another process holds the file.
    pub fn open(path: &Path) -> JournalResult<Self> {
        let file = Self::open_locked(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Opens the journal, creating parent directories if needed.
    pub fn open_with_create_dirs(path: &Path) -> JournalResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the journal path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_locked(path: &Path) -> JournalResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(JournalError::Locked(path.display().to_string()));
        }
        Ok(file)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl JournalBackend for FileBackend {
    fn read_all(&self) -> JournalResult<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> JournalResult<u64> {
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        if !data.is_empty() {
            file.write_all(data)?;
            file.flush()?;
        }
        Ok(offset)
    }

    fn sync(&mut self) -> JournalResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn size(&self) -> JournalResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn truncate(&mut self, new_size: u64) -> JournalResult<()> {
        let file = self.file.lock();
        if new_size < file.metadata()?.len() {
            file.set_len(new_size)?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> JournalResult<()> {
        let temp = self.temp_path();
        {
            let mut staged = File::create(&temp)?;
            staged.write_all(data)?;
            staged.sync_all()?;
        }

        let mut file = self.file.lock();
        // Unlocked across the rename; the new handle is relocked below.
        let _ = FileExt::unlock(&*file);
        fs::rename(&temp, &self.path)?;
        *file = Self::open_locked(&self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
