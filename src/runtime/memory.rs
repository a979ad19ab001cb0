//! WebAssembly linear memory
//!
//! All guest accesses are bounds-checked before touching the underlying bytes:
//! an access of `width` bytes at `address + offset` succeeds only when the whole
//! range lies below the current size. The sum is computed in 64 bits, so
//! address/offset combinations that would wrap a 32-bit sum trap instead.
//!
//! - Page size: 64KB (65,536 bytes)
//! - Address space: 32-bit (max 4GB)
//! - Out-of-bounds access: `TrapKind::OutOfBoundsMemoryAccess`

use super::trap::TrapKind;
use crate::error::FormatError;
use crate::module::{Limits, MAX_PAGES};

/// WebAssembly page size in bytes (64KB)
pub const PAGE_SIZE: usize = 65536;

#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
    current_pages: u32,
    max_pages: Option<u32>,
}

impl Memory {
    /// Create a zero-filled memory of `limits.min` pages
    pub fn new(limits: Limits) -> Result<Self, FormatError> {
        if limits.min > MAX_PAGES {
            return Err(FormatError::InvalidLimits(format!(
                "initial memory size {} pages exceeds maximum {MAX_PAGES} pages",
                limits.min
            )));
        }
        if let Some(max) = limits.max {
            if limits.min > max || max > MAX_PAGES {
                return Err(FormatError::InvalidLimits(format!("memory {limits}")));
            }
        }

        Ok(Memory {
            data: vec![0u8; limits.min as usize * PAGE_SIZE],
            current_pages: limits.min,
            max_pages: limits.max,
        })
    }

    /// Current size in pages
    pub fn size(&self) -> u32 {
        self.current_pages
    }

    /// Current size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limits(&self) -> Limits {
        Limits::new(self.current_pages, self.max_pages)
    }

    /// Base pointer of the byte buffer. Invalidated by [`Memory::grow`].
    pub(crate) fn data_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// Grow by `delta_pages`, zero-filling the new pages.
    ///
    /// Returns the previous size in pages, or -1 if the maximum would be exceeded or the
    /// allocation fails.
    pub fn grow(&mut self, delta_pages: u32) -> i32 {
        let current = self.current_pages;

        let Some(new_pages) = current.checked_add(delta_pages) else {
            return -1;
        };
        if new_pages > self.max_pages.unwrap_or(MAX_PAGES) {
            return -1;
        }

        let new_bytes = new_pages as usize * PAGE_SIZE;
        match self.data.try_reserve(new_bytes - self.data.len()) {
            Ok(()) => {
                self.data.resize(new_bytes, 0);
                self.current_pages = new_pages;
                current as i32
            }
            Err(_) => -1,
        }
    }

    /// Validate an access of `width` bytes at `address + offset`, returning the start index
    #[inline]
    fn check_bounds(&self, address: u32, offset: u32, width: usize) -> Result<usize, TrapKind> {
        let start = address as u64 + offset as u64;
        let end = start + width as u64;
        if end > self.data.len() as u64 {
            return Err(TrapKind::OutOfBoundsMemoryAccess);
        }
        Ok(start as usize)
    }

    /// Little-endian read of `N` bytes
    pub fn load<const N: usize>(&self, address: u32, offset: u32) -> Result<[u8; N], TrapKind> {
        let start = self.check_bounds(address, offset, N)?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.data[start..start + N]);
        Ok(bytes)
    }

    /// Little-endian write of `N` bytes
    pub fn store<const N: usize>(&mut self, address: u32, offset: u32, bytes: [u8; N]) -> Result<(), TrapKind> {
        let start = self.check_bounds(address, offset, N)?;
        self.data[start..start + N].copy_from_slice(&bytes);
        Ok(())
    }

    /// Copy bytes out of memory
    pub fn read_bytes(&self, address: u32, len: usize) -> Result<Vec<u8>, TrapKind> {
        let start = self.check_bounds(address, 0, len)?;
        Ok(self.data[start..start + len].to_vec())
    }

    /// Copy bytes into memory
    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<(), TrapKind> {
        let start = self.check_bounds(address, 0, bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
