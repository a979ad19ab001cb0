//! Executable buffers for generated code
//!
//! Pages are mapped read-write, filled, then flipped to read-execute before
//! any code runs. They are never writable and executable at the same time.

use std::fmt;
use std::io::Error;
use std::ptr;

pub struct CodeMemory {
    ptr: *mut u8,
    len: usize,
    mmap_len: usize,
}

impl CodeMemory {
    /// Copy `code` into freshly mapped pages and make them executable
    pub fn new(code: &[u8]) -> std::io::Result<Self> {
        let page_size = page_size();
        let mmap_len = (code.len().max(1) + page_size - 1) & !(page_size - 1);

        unsafe {
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Unmapped on drop if anything below fails.
            let out = CodeMemory {
                ptr: mmap.cast::<u8>(),
                len: code.len(),
                mmap_len,
            };

            ptr::copy_nonoverlapping(code.as_ptr(), out.ptr, code.len());
            if libc::mprotect(mmap, mmap_len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Bytes of code, excluding page padding
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the byte at `offset`
    pub fn address(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.len);
        self.ptr.wrapping_add(offset)
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

// SAFETY: the mapping is read-execute for its whole life and owned by this value.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        unsafe {
            let ret = libc::munmap(self.ptr.cast(), self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

impl fmt::Debug for CodeMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeMemory")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

pub(super) fn page_size() -> usize {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copies_code() {
        let code = [0xc3u8, 0x90, 0x90];
        let memory = CodeMemory::new(&code).unwrap();
        assert_eq!(memory.len(), 3);
        assert_eq!(memory.bytes(), &code);
    }

    #[test]
    fn test_runs_code() {
        // mov eax, 42; ret
        let memory = CodeMemory::new(&[0xb8, 42, 0, 0, 0, 0xc3]).unwrap();
        let f: extern "sysv64" fn() -> u32 = unsafe { std::mem::transmute(memory.address(0)) };
        assert_eq!(f(), 42);
    }
}
