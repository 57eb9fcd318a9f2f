// storage/src/file/mod.rs

use crate::config::DiskOptions;
use crate::page::PageId;
use crate::{Result, StorageError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Whole-page I/O against one data file.
///
/// Page `n` lives at byte offset `n * page_size`. The manager never looks
/// inside pages: callers serialize before [`write_page`](Self::write_page)
/// and deserialize after [`read_page`](Self::read_page).
///
/// Writes are in place and not atomic; a crash mid-write can tear a page,
/// which the page checksum detects on the next read. Atomic updates are the
/// job of a log above this layer.
#[derive(Debug)]
pub struct DiskManager {
    file: File,
    path: PathBuf,
    page_size: usize,
    page_count: u64,
    locked: bool,
}

impl DiskManager {
    /// Opens (or creates) the data file at `path` with the default options.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        Self::open_with(path, DiskOptions::new().with_page_size(page_size))
    }

    pub fn open_with(path: impl AsRef<Path>, options: DiskOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(options.create)
            .open(&path)
            .map_err(StorageError::Io)?;

        if options.lock {
            if let Err(e) = file.try_lock_exclusive() {
                if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                    return Err(StorageError::FileLocked(path));
                }
                return Err(StorageError::Io(e));
            }
        }

        let size = file.metadata()?.len();
        let page_size = options.page_size;
        if size % page_size as u64 != 0 {
            return Err(StorageError::InvalidFileSize { size, page_size });
        }
        let page_count = size / page_size as u64;

        log::debug!(
            "opened {} (page size {}, {} pages)",
            path.display(),
            page_size,
            page_count
        );

        Ok(Self {
            file,
            path,
            page_size,
            page_count,
            locked: options.lock,
        })
    }

    /// Reads page `page_id` into `buf`, which must be exactly one page long.
    ///
    /// A page id at or past the end of the file yields
    /// [`StorageError::InvalidPageId`]; a partial page at the tail yields
    /// [`StorageError::CorruptPage`].
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        self.check_buffer(buf.len())?;

        let offset = self.page_offset(page_id)?;
        log::trace!("read page {} at offset {}", page_id, offset);

        // Another handle may have appended since open, so only the file
        // length is authoritative here.
        if page_id >= self.page_count && offset >= self.file.metadata()?.len() {
            return Err(StorageError::InvalidPageId(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let read = read_full(&mut self.file, buf)?;

        if read == 0 {
            return Err(StorageError::InvalidPageId(page_id));
        }
        if read < self.page_size {
            log::warn!(
                "short read of page {}: {} of {} bytes",
                page_id,
                read,
                self.page_size
            );
            return Err(StorageError::CorruptPage { page_id, read });
        }

        Ok(())
    }

    /// Overwrites page `page_id` in place. The page must already have been
    /// allocated.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.check_buffer(data.len())?;

        if page_id >= self.page_count {
            return Err(StorageError::InvalidPageId(page_id));
        }

        let offset = self.page_offset(page_id)?;
        log::trace!("write page {} at offset {}", page_id, offset);

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;

        Ok(())
    }

    /// Appends one zeroed page to the file and returns its id.
    ///
    /// Ids are dense and never reused.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let size = self.file.metadata()?.len();
        let page_id = size / self.page_size as u64;

        let offset = self.page_offset(page_id)?;
        let zeros = vec![0u8; self.page_size];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&zeros)?;

        self.page_count = page_id + 1;
        log::debug!("allocated page {} in {}", page_id, self.path.display());

        Ok(page_id)
    }

    /// Flushes all previously issued writes to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(StorageError::Io)
    }

    /// Releases the lock and the file handle.
    pub fn close(self) -> Result<()> {
        if self.locked {
            self.file.unlock()?;
            log::debug!("released lock on {}", self.path.display());
        }
        Ok(())
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_buffer(&self, len: usize) -> Result<()> {
        if len != self.page_size {
            return Err(StorageError::BufferSizeMismatch {
                expected: self.page_size,
                actual: len,
            });
        }
        Ok(())
    }

    /// Byte offset of `page_id`. The whole page must end at or below
    /// `i64::MAX`, the largest position `seek` accepts.
    fn page_offset(&self, page_id: PageId) -> Result<u64> {
        let page_size = self.page_size as u64;
        page_id
            .checked_mul(page_size)
            .filter(|offset| {
                offset
                    .checked_add(page_size)
                    .map_or(false, |end| end <= i64::MAX as u64)
            })
            .ok_or(StorageError::InvalidPageId(page_id))
    }
}

/// Reads until `buf` is full or the file ends, returning the bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
