//! Subsystem configuration
//!
//! Collected in one place so the embedding kernel can size tables and quotas
//! at initialization time.

use crate::log::LogLevel;

/// Default byte size of one handle-table page
pub const DEFAULT_TABLE_PAGE_SIZE: usize = 4096;

/// Smallest page size a handle table accepts
pub const MIN_TABLE_PAGE_SIZE: usize = 64;

/// Configuration for [`crate::kernel::IpcKernel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcConfig {
    /// Page size used by every handle table
    pub table_page_size: usize,
    /// Hard limit of bytes the kernel allocator hands out (`None` = unlimited)
    pub allocator_limit: Option<usize>,
    /// Item quota of per-process default queues (0 = unlimited)
    pub default_item_quota: usize,
    /// Byte quota of per-process default queues (0 = unlimited)
    pub default_byte_quota: usize,
    /// Minimum log level
    pub log_level: LogLevel,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            table_page_size: DEFAULT_TABLE_PAGE_SIZE,
            allocator_limit: None,
            default_item_quota: 0,
            default_byte_quota: 0,
            log_level: LogLevel::Debug,
        }
    }
}

impl IpcConfig {
    pub fn with_table_page_size(mut self, size: usize) -> Self {
        self.table_page_size = size.max(MIN_TABLE_PAGE_SIZE);
        self
    }

    pub fn with_allocator_limit(mut self, bytes: usize) -> Self {
        self.allocator_limit = Some(bytes);
        self
    }

    pub fn with_default_quota(mut self, items: usize, bytes: usize) -> Self {
        self.default_item_quota = items;
        self.default_byte_quota = bytes;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}
