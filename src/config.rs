use std::path::PathBuf;

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Size at which the active file is rotated to an inactive slot
    /// (default: 2^31 - 1 bytes)
    pub max_file_size: u64,

    /// Maximum number of pooled random-access reader handles (default: 10)
    pub max_readers: usize,

    /// Prefix on-disk keys with a derived filter byte (default: false)
    pub prefixed_keys: bool,
}

/// Default rotation threshold, also the hard bound on a single value.
pub const DEFAULT_MAX_FILE_SIZE: u64 = (1 << 31) - 1;

/// Default reader pool capacity.
pub const DEFAULT_MAX_READERS: usize = 10;

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./firkin"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            prefixed_keys: false,
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the active file rotation threshold
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Set the reader pool capacity
    pub fn max_readers(mut self, readers: usize) -> Self {
        self.max_readers = readers;
        self
    }

    /// Enable the prefixed on-disk key layout
    pub fn prefixed_keys(mut self, enabled: bool) -> Self {
        self.prefixed_keys = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dir, PathBuf::from("./firkin"));
        assert_eq!(config.max_file_size, (1 << 31) - 1);
        assert_eq!(config.max_readers, 10);
        assert!(!config.prefixed_keys);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .max_file_size(4096)
            .max_readers(2)
            .prefixed_keys(true);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.max_file_size, 4096);
        assert_eq!(config.max_readers, 2);
        assert!(config.prefixed_keys);
    }
}
