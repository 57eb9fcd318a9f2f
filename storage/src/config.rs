// storage/src/config.rs

use crate::page::PAGE_SIZE;
use crate::{Result, StorageError};

/// Options for [`DiskManager::open_with`](crate::DiskManager::open_with).
///
/// With the `serde` feature enabled this can be embedded in an application
/// config; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DiskOptions {
    /// Page size in bytes. Must match the size the file was created with.
    pub page_size: usize,
    /// Create the data file if it does not exist.
    pub create: bool,
    /// Hold an exclusive advisory lock on the data file while open.
    pub lock: bool,
}

impl DiskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(StorageError::InvalidConfig(
                "page size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            create: true,
            lock: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = DiskOptions::default();
        assert_eq!(opts.page_size, 8192);
        assert!(opts.create);
        assert!(opts.lock);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let opts = DiskOptions::new()
            .with_page_size(4096)
            .create(false)
            .lock(false);
        assert_eq!(
            opts,
            DiskOptions {
                page_size: 4096,
                create: false,
                lock: false,
            }
        );
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let opts = DiskOptions::new().with_page_size(0);
        assert!(matches!(opts.validate(), Err(StorageError::InvalidConfig(_))));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_deserialize_partial() {
        let opts: DiskOptions = serde_json::from_str(r#"{ "page_size": 4096 }"#).unwrap();
        assert_eq!(opts.page_size, 4096);
        assert!(opts.create);
        assert!(opts.lock);
    }
}
