//! Guest execution dispatcher.
//!
//! [`Vcpu`] owns one guest thread's context and drives the
//! translate/optimize/compile/execute loop: look the current pc up in the
//! shared [`TranslationCache`], translate and publish on a miss, run the
//! block (native when the backend accepted it, interpreter otherwise), then
//! apply the block outcome to the context. The loop only returns to the
//! caller for things the execution core cannot resolve itself: system
//! calls, breakpoints, undefined encodings, memory faults, and external
//! stop requests.
//!
//! Stop requests are asynchronous but drained only at block boundaries, so
//! the context the caller sees is always at an instruction boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vesper_cpu_core::{CpuState, ExitReason};
use vesper_mem::{AccessKind, AddressSpace, FaultKind, MemoryError};
use vesper_types::IsaMode;

use crate::backend::{self, FastWindow};
use crate::cache::{CompiledBlock, TranslationCache};
use crate::interp::{run_ir, BlockOutcome};
use crate::ir::TrapKind;
use crate::opt::{optimize, OptConfig};
use crate::translate::{translate_block, BlockLimits, TranslateError};

/// Cross-thread stop request for a running [`Vcpu`].
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the vcpu to return [`ExitReason::Stopped`] at the next block
    /// boundary. Idempotent; a stopped vcpu can be resumed with `run`.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// One guest hardware thread: context plus the machinery to run it.
pub struct Vcpu {
    cpu: CpuState,
    space: Arc<AddressSpace>,
    cache: Arc<TranslationCache>,
    stop: Arc<AtomicBool>,
    window: Option<FastWindow>,
    /// Optimization passes applied to freshly translated blocks.
    pub opt: OptConfig,
    pub limits: BlockLimits,
    /// When false every block runs on the interpreter; used by the
    /// differential tests and as an escape hatch.
    pub native_enabled: bool,
}

impl Vcpu {
    pub fn new(
        space: Arc<AddressSpace>,
        cache: Arc<TranslationCache>,
        entry: u64,
        mode: IsaMode,
    ) -> Self {
        space.attach_view();
        Vcpu {
            cpu: CpuState::new(entry, mode),
            space,
            cache,
            stop: Arc::new(AtomicBool::new(false)),
            window: None,
            opt: OptConfig::default(),
            limits: BlockLimits::default(),
            native_enabled: true,
        }
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Run until something needs the caller. The context's pc points at the
    /// instruction to resume with (for traps, the one after the trapping
    /// instruction; for faults, the faulting instruction itself).
    pub fn run(&mut self) -> ExitReason {
        loop {
            if let Some(exit) = self.step() {
                return exit;
            }
        }
    }

    /// Execute one block. `None` means execution continues.
    pub fn step(&mut self) -> Option<ExitReason> {
        if self.stop.swap(false, Ordering::Acquire) {
            return Some(ExitReason::Stopped);
        }
        let pc = self.cpu.pc;
        let mode = self.cpu.isa_mode;
        if pc % mode.fetch_align() != 0 {
            return Some(ExitReason::MemoryFault {
                addr: pc,
                kind: FaultKind::Misaligned(AccessKind::Execute),
            });
        }

        let block = match self.cache.lookup(&self.space, pc, mode) {
            Some(block) => block,
            None => match self.translate(pc, mode) {
                Ok(block) => block,
                Err(TranslateError::Fetch(MemoryError::Fault { addr, kind })) => {
                    return Some(ExitReason::MemoryFault { addr, kind });
                }
            },
        };

        let outcome = match (&block.native, self.native_enabled) {
            (Some(native), true) => native.execute(&mut self.cpu, &self.space, &mut self.window),
            _ => run_ir(&block.ir, &mut self.cpu, &self.space),
        };
        match outcome {
            Ok(BlockOutcome::Jump { pc }) => {
                self.cpu.pc = pc;
                None
            }
            Ok(BlockOutcome::Exchange { pc }) => {
                // Interworking branch: bit 0 of the target selects the
                // compact mode.
                self.cpu.isa_mode = if pc & 1 != 0 {
                    IsaMode::T16
                } else {
                    IsaMode::A32
                };
                self.cpu.pc = pc & !1;
                None
            }
            Ok(BlockOutcome::Trap { kind, resume_pc }) => {
                self.cpu.pc = resume_pc;
                Some(match kind {
                    TrapKind::Syscall { imm } => ExitReason::SystemCall { imm },
                    TrapKind::Breakpoint { imm } => ExitReason::Breakpoint { imm },
                    TrapKind::Undefined { pc } => ExitReason::UndefinedInstruction { pc },
                })
            }
            Err(fault) => {
                self.cpu.pc = fault.pc;
                let MemoryError::Fault { addr, kind } = fault.error;
                Some(ExitReason::MemoryFault { addr, kind })
            }
        }
    }

    fn translate(&mut self, pc: u64, mode: IsaMode) -> Result<Arc<CompiledBlock>, TranslateError> {
        // Snapshot before fetching: a write racing this translation makes
        // the published block stale instead of silently surviving.
        let max_bytes = self.limits.max_insts as u64 * vesper_cpu_decoder::inst_len(mode);
        let versions = self.space.code_versions().snapshot(pc, max_bytes);
        let mapping_gen = self.space.mapping_generation();

        let mut ir = translate_block(&self.space, pc, mode, &self.limits)?;
        optimize(&mut ir, &self.opt);
        let native = if self.native_enabled {
            match backend::compile(&ir) {
                Ok(native) => Some(Arc::new(native)),
                Err(err) => {
                    tracing::debug!(pc, %err, "block stays on the interpreter");
                    None
                }
            }
        } else {
            None
        };
        let block = Arc::new(CompiledBlock::new(
            Arc::new(ir),
            native,
            versions,
            mapping_gen,
        ));
        Ok(self.cache.insert(pc, mode, block))
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        self.space.release_view();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_mem::Perm;
    use vesper_types::{Gpr, Width};

    fn machine(code: &[u32]) -> Vcpu {
        let space = Arc::new(AddressSpace::new());
        space.map(0x1000, 0x1000, Perm::RWX).unwrap();
        for (i, word) in code.iter().enumerate() {
            space
                .write(0x1000 + i as u64 * 4, Width::W32, *word as u64)
                .unwrap();
        }
        Vcpu::new(space, Arc::new(TranslationCache::new()), 0x1000, IsaMode::A64)
    }

    #[test]
    fn system_call_returns_with_immediate_and_resume_pc() {
        // ADD X0, X1, #42 ; SVC #7
        let mut vcpu = machine(&[0x9100_a820, 0xd400_00e1]);
        vcpu.cpu_mut().set_x(Gpr::new(1).unwrap(), 8);
        assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 7 });
        assert_eq!(vcpu.cpu().x(Gpr::new(0).unwrap()), 50);
        assert_eq!(vcpu.cpu().pc, 0x1008);
    }

    #[test]
    fn breakpoint_resumes_at_the_breakpoint() {
        // BRK #2
        let mut vcpu = machine(&[0xd420_0040]);
        assert_eq!(vcpu.run(), ExitReason::Breakpoint { imm: 2 });
        assert_eq!(vcpu.cpu().pc, 0x1000);
    }

    #[test]
    fn undefined_encoding_reports_its_pc() {
        let mut vcpu = machine(&[0xd503_201f, 0x0000_0000]);
        assert_eq!(
            vcpu.run(),
            ExitReason::UndefinedInstruction { pc: 0x1004 }
        );
        assert_eq!(vcpu.cpu().pc, 0x1004);
    }

    #[test]
    fn unmapped_pc_is_a_fetch_fault() {
        let mut vcpu = machine(&[]);
        vcpu.cpu_mut().pc = 0x8000;
        assert_eq!(
            vcpu.run(),
            ExitReason::MemoryFault {
                addr: 0x8000,
                kind: FaultKind::Unmapped,
            }
        );
    }

    #[test]
    fn misaligned_pc_is_an_execute_fault() {
        let mut vcpu = machine(&[0xd503_201f]);
        vcpu.cpu_mut().pc = 0x1002;
        assert_eq!(
            vcpu.run(),
            ExitReason::MemoryFault {
                addr: 0x1002,
                kind: FaultKind::Misaligned(AccessKind::Execute),
            }
        );
    }

    #[test]
    fn stop_request_drains_at_a_block_boundary() {
        // B . (tight self-loop) would never exit on its own.
        let mut vcpu = machine(&[0x1400_0000]);
        let handle = vcpu.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.request_stop();
        });
        assert_eq!(vcpu.run(), ExitReason::Stopped);
        stopper.join().unwrap();
        // The request was drained; the vcpu can be stopped again.
        vcpu.stop_handle().request_stop();
        assert_eq!(vcpu.run(), ExitReason::Stopped);
    }

    #[test]
    fn blocks_are_shared_through_the_cache() {
        // Two SVCs in a row: resuming after the first re-enters the same
        // block chain without retranslating the second block.
        let mut vcpu = machine(&[0xd400_00e1, 0xd400_0001]);
        assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 7 });
        assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 0 });
        let translations = vcpu.cache.translations();
        vcpu.cpu_mut().pc = 0x1000;
        assert_eq!(vcpu.run(), ExitReason::SystemCall { imm: 7 });
        assert_eq!(vcpu.cache.translations(), translations);
    }

    #[test]
    fn interpreter_and_native_agree_on_a_program() {
        // MOV X1, #100 ; ADD X0, X1, #42 ; SUBS X2, X0, #142 ; SVC #0
        let code = [0xd280_0c81, 0x9100_a820, 0xf102_3802, 0xd400_0001];
        let mut native = machine(&code);
        let mut interp = machine(&code);
        interp.native_enabled = false;
        assert_eq!(native.run(), ExitReason::SystemCall { imm: 0 });
        assert_eq!(interp.run(), ExitReason::SystemCall { imm: 0 });
        assert_eq!(native.cpu().gpr, interp.cpu().gpr);
        assert_eq!(native.cpu().pstate, interp.cpu().pstate);
        assert_eq!(native.cpu().pc, interp.cpu().pc);
    }
}
