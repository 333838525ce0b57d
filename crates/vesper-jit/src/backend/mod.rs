//! Native code backend.
//!
//! Compiles IR blocks to host machine code. Only x86-64 unix hosts have an
//! emitter; everywhere else [`compile`] declines every block and execution
//! stays on the interpreter. The backend is also allowed to decline
//! individual blocks ([`CompileError::Unsupported`]) — the dispatcher runs
//! those through the interpreter, so the emitter only needs to cover the
//! operations worth compiling.

use crate::ir::IrBlock;

#[cfg(all(unix, target_arch = "x86_64"))]
mod env;
#[cfg(all(unix, target_arch = "x86_64"))]
mod x64;

#[cfg(all(unix, target_arch = "x86_64"))]
pub use env::{FastWindow, JitEnv};
#[cfg(all(unix, target_arch = "x86_64"))]
pub use x64::NativeBlock;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The block uses an operation the emitter does not cover.
    #[error("operation not supported by the native backend")]
    Unsupported,
    /// The host refused the executable mapping for the emitted code.
    #[error("code buffer allocation failed")]
    Alloc,
}

/// Compile a block for the host, or decline it.
pub fn compile(block: &IrBlock) -> Result<NativeBlock, CompileError> {
    #[cfg(all(unix, target_arch = "x86_64"))]
    {
        x64::compile(block)
    }
    #[cfg(not(all(unix, target_arch = "x86_64")))]
    {
        let _ = block;
        Err(CompileError::Unsupported)
    }
}

/// Host-independent stand-ins so the cache and dispatcher compile on hosts
/// without an emitter. Never constructed there.
#[cfg(not(all(unix, target_arch = "x86_64")))]
pub enum NativeBlock {}

#[cfg(not(all(unix, target_arch = "x86_64")))]
#[derive(Default)]
pub struct FastWindow;

#[cfg(not(all(unix, target_arch = "x86_64")))]
impl NativeBlock {
    pub fn execute(
        &self,
        _cpu: &mut vesper_cpu_core::CpuState,
        _space: &vesper_mem::AddressSpace,
        _window: &mut Option<FastWindow>,
    ) -> Result<crate::interp::BlockOutcome, crate::interp::MemFault> {
        match *self {}
    }
}

/// Executable code buffer: filled writable, then remapped execute-only.
#[cfg(all(unix, target_arch = "x86_64"))]
pub(crate) struct CodeBuf {
    ptr: *mut u8,
    len: usize,
}

#[cfg(all(unix, target_arch = "x86_64"))]
impl CodeBuf {
    pub(crate) fn new(code: &[u8]) -> Result<Self, CompileError> {
        let len = code.len().max(1);
        // Round to the host page size mmap works in anyway.
        let len = (len + 0xfff) & !0xfff;
        // SAFETY: anonymous private mapping, fully owned by this buffer.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CompileError::Alloc);
        }
        let ptr = ptr as *mut u8;
        // SAFETY: the mapping is at least code.len() bytes and writable.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC)
                != 0
            {
                libc::munmap(ptr as *mut libc::c_void, len);
                return Err(CompileError::Alloc);
            }
        }
        Ok(CodeBuf { ptr, len })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

#[cfg(all(unix, target_arch = "x86_64"))]
impl Drop for CodeBuf {
    fn drop(&mut self) {
        // SAFETY: mapping created by new() and never split.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// The buffer is immutable executable memory once published.
#[cfg(all(unix, target_arch = "x86_64"))]
unsafe impl Send for CodeBuf {}
#[cfg(all(unix, target_arch = "x86_64"))]
unsafe impl Sync for CodeBuf {}
