//! Storage configuration.
//!
//! Settings arrive as string properties in the `nanodb.*` namespace; this
//! module parses and validates them into a typed `StorageConfig` consumed
//! when the storage manager is constructed.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::storage::buffer::EvictionPolicy;
use crate::storage::dbfile;

/// Base directory for all database files.
pub const PROP_BASE_DIR: &str = "nanodb.basedir";

/// Page size for newly created files; a power of two in [512, 65536].
pub const PROP_PAGE_SIZE: &str = "nanodb.pagesize";

/// Page-cache capacity in bytes; accepts `k`/`m`/`g` suffixes.
pub const PROP_PAGECACHE_SIZE: &str = "nanodb.pagecache.size";

/// Page-cache eviction policy: `lru` or `fifo`.
pub const PROP_PAGECACHE_POLICY: &str = "nanodb.pagecache.policy";

/// Default base directory.
pub const DEFAULT_BASE_DIR: &str = "./datafiles";

/// Default page-cache capacity: 4 MiB.
pub const DEFAULT_PAGECACHE_SIZE: usize = 4 * 1024 * 1024;

/// Typed storage settings with defaults for every property.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub base_dir: PathBuf,
    pub page_size: u32,
    pub page_cache_size: usize,
    pub page_cache_policy: EvictionPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            page_size: dbfile::DEFAULT_PAGE_SIZE,
            page_cache_size: DEFAULT_PAGECACHE_SIZE,
            page_cache_policy: EvictionPolicy::Lru,
        }
    }
}

impl StorageConfig {
    /// Applies one string property. Unknown keys and malformed values are
    /// rejected.
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            PROP_BASE_DIR => {
                if value.is_empty() {
                    return Err(Error::invalid_arg("empty base directory"));
                }
                self.base_dir = PathBuf::from(value);
            }
            PROP_PAGE_SIZE => {
                let size: u32 = value
                    .parse()
                    .map_err(|_| Error::invalid_arg(format!("bad page size \"{}\"", value)))?;
                if !dbfile::is_valid_page_size(size) {
                    return Err(Error::InvalidPageSize(size));
                }
                self.page_size = size;
            }
            PROP_PAGECACHE_SIZE => {
                self.page_cache_size = parse_size_spec(value)?;
            }
            PROP_PAGECACHE_POLICY => {
                self.page_cache_policy = match value.to_ascii_lowercase().as_str() {
                    "lru" => EvictionPolicy::Lru,
                    "fifo" => EvictionPolicy::Fifo,
                    other => {
                        return Err(Error::invalid_arg(format!(
                            "unrecognized page-cache policy \"{}\"",
                            other
                        )))
                    }
                };
            }
            other => {
                return Err(Error::invalid_arg(format!(
                    "unrecognized storage property \"{}\"",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Builds a config from an iterator of `(key, value)` properties.
    pub fn from_properties<'a, I>(props: I) -> Result<StorageConfig>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = StorageConfig::default();
        for (key, value) in props {
            config.set_property(key, value)?;
        }
        Ok(config)
    }
}

/// Parses a byte-count spec with an optional `k`, `m`, or `g` suffix
/// (case-insensitive), e.g. `"262144"`, `"256k"`, `"4m"`.
pub fn parse_size_spec(spec: &str) -> Result<usize> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(Error::invalid_arg("empty size specification"));
    }

    let (digits, multiplier) = match spec.as_bytes()[spec.len() - 1].to_ascii_lowercase() {
        b'k' => (&spec[..spec.len() - 1], 1024usize),
        b'm' => (&spec[..spec.len() - 1], 1024 * 1024),
        b'g' => (&spec[..spec.len() - 1], 1024 * 1024 * 1024),
        _ => (spec, 1),
    };

    let count: usize = digits
        .parse()
        .map_err(|_| Error::invalid_arg(format!("bad size specification \"{}\"", spec)))?;
    count
        .checked_mul(multiplier)
        .ok_or_else(|| Error::invalid_arg(format!("size specification \"{}\" overflows", spec)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_spec() {
        assert_eq!(parse_size_spec("4096").unwrap(), 4096);
        assert_eq!(parse_size_spec("256k").unwrap(), 256 * 1024);
        assert_eq!(parse_size_spec("4M").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_size_spec("1g").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size_spec("").is_err());
        assert!(parse_size_spec("12q").is_err());
        assert!(parse_size_spec("k").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.page_cache_size, DEFAULT_PAGECACHE_SIZE);
        assert_eq!(config.page_cache_policy, EvictionPolicy::Lru);
    }

    #[test]
    fn test_set_properties() {
        let mut config = StorageConfig::default();
        config.set_property(PROP_PAGE_SIZE, "1024").unwrap();
        assert_eq!(config.page_size, 1024);
        assert!(config.set_property(PROP_PAGE_SIZE, "1000").is_err());

        config.set_property(PROP_PAGECACHE_POLICY, "fifo").unwrap();
        assert_eq!(config.page_cache_policy, EvictionPolicy::Fifo);
        assert!(config.set_property(PROP_PAGECACHE_POLICY, "arc").is_err());

        config.set_property(PROP_PAGECACHE_SIZE, "64k").unwrap();
        assert_eq!(config.page_cache_size, 64 * 1024);

        assert!(config.set_property("nanodb.unknown", "1").is_err());
    }

    #[test]
    fn test_from_properties() {
        let config = StorageConfig::from_properties(vec![
            (PROP_PAGE_SIZE, "512"),
            (PROP_PAGECACHE_POLICY, "LRU"),
        ])
        .unwrap();
        assert_eq!(config.page_size, 512);
        assert_eq!(config.page_cache_policy, EvictionPolicy::Lru);
    }
}
