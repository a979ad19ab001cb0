//! Dedicated stacks for native code
//!
//! Every guest call nests a native frame, so an invocation switches to its own
//! mapping, sized from the call depth limit, instead of growing the embedder's
//! thread stack. [`JitContext::call`](super::context::JitContext) refuses to
//! enter a callee once less than [`STACK_RESERVE`] bytes remain, which turns
//! exhaustion into a `CallStackExhausted` trap.

use std::fmt;
use std::io::Error;
use std::ptr;

use once_cell::sync::OnceCell;

use super::asm::{Assembler, Reg};
use super::code_memory::{page_size, CodeMemory};
use super::context::JitContext;

/// Native bytes budgeted for each active guest frame
pub const NATIVE_FRAME_BYTES: usize = 4096;
/// Deepest call depth a stack is sized for; deeper limits trap on stack space instead
pub const MAX_NATIVE_DEPTH: usize = 1 << 16;
/// Kept free below the deepest guest frame for host functions and runtime helpers
pub const STACK_RESERVE: usize = 1 << 20;

/// Called on the new stack as `target(ctx, frame, addr)`
pub(super) type Target = unsafe extern "sysv64" fn(*mut JitContext, *mut u64, usize) -> u32;

/// `(ctx, frame, addr, target, stack_top) -> status`
type Trampoline = unsafe extern "sysv64" fn(*mut JitContext, *mut u64, usize, Target, *mut u8) -> u32;

static TRAMPOLINE: OnceCell<CodeMemory> = OnceCell::new();

pub struct NativeStack {
    ptr: *mut u8,
    mmap_len: usize,
    guard_len: usize,
}

impl NativeStack {
    /// A stack with room for `max_call_depth` guest frames
    pub fn for_depth(max_call_depth: usize) -> std::io::Result<Self> {
        NativeStack::new(max_call_depth.min(MAX_NATIVE_DEPTH) * NATIVE_FRAME_BYTES + STACK_RESERVE)
    }

    /// Map at least `size` usable bytes above a guard page
    pub fn new(size: usize) -> std::io::Result<Self> {
        let page_size = page_size();
        let size = (size.max(STACK_RESERVE) + page_size - 1) & !(page_size - 1);
        let mmap_len = size + page_size;

        unsafe {
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Unmapped on drop if the mprotect below fails.
            let out = NativeStack {
                ptr: mmap.cast::<u8>(),
                mmap_len,
                guard_len: page_size,
            };

            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// One past the highest usable byte; page aligned
    pub fn top(&self) -> *mut u8 {
        self.ptr.wrapping_add(self.mmap_len)
    }

    /// Lowest stack address from which another call may be entered
    pub fn limit(&self) -> usize {
        self.ptr as usize + self.guard_len + STACK_RESERVE
    }

    pub fn size(&self) -> usize {
        self.mmap_len - self.guard_len
    }

    /// Run `target(ctx, frame, addr)` with this stack as the native stack
    ///
    /// # Safety
    ///
    /// `ctx` and `frame` must be valid for `target`, and nothing may still
    /// run on this stack when it is dropped.
    pub(super) unsafe fn run(
        &self,
        ctx: *mut JitContext,
        frame: *mut u64,
        addr: usize,
        target: Target,
    ) -> std::io::Result<u32> {
        let trampoline = TRAMPOLINE.get_or_try_init(|| CodeMemory::new(&trampoline_code()))?;
        let trampoline = std::mem::transmute::<*const u8, Trampoline>(trampoline.address(0));
        Ok(trampoline(ctx, frame, addr, target, self.top()))
    }
}

impl Drop for NativeStack {
    fn drop(&mut self) {
        unsafe {
            let ret = libc::munmap(self.ptr.cast(), self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

impl fmt::Debug for NativeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeStack")
            .field("ptr", &self.ptr)
            .field("size", &self.size())
            .finish()
    }
}

/// Save rsp in rbp, switch to `stack_top` (r8), call `target` (rcx) with the
/// first three arguments untouched, then switch back
fn trampoline_code() -> Vec<u8> {
    let mut asm = Assembler::new();
    asm.push(Reg::Rbp);
    asm.mov(true, Reg::Rbp, Reg::Rsp);
    asm.mov(true, Reg::Rsp, Reg::R8);
    asm.call(Reg::Rcx);
    asm.mov(true, Reg::Rsp, Reg::Rbp);
    asm.pop(Reg::Rbp);
    asm.ret();
    asm.finish().unwrap_or_default()
}
