//! Dynamic binary translation core.
//!
//! Pipeline: [`translate`] turns guest instruction runs into straight-line
//! SSA blocks ([`ir`]), [`opt`] simplifies them, [`backend`] compiles them
//! to host code where it can, and [`cache`] publishes the results keyed by
//! entry address and instruction-set mode with write-coherent invalidation.
//! [`dispatch::Vcpu`] ties it together into a run loop over a
//! [`vesper_cpu_core::CpuState`]; [`interp`] executes any block the backend
//! declines, and is the reference the native path is tested against.

pub mod backend;
pub mod cache;
pub mod dispatch;
pub mod interp;
pub mod ir;
pub mod opt;
pub mod translate;

pub use cache::{CompiledBlock, TranslationCache};
pub use dispatch::{StopHandle, Vcpu};
pub use interp::{run_ir, BlockOutcome, MemFault};
pub use opt::{optimize, OptConfig};
pub use translate::{translate_block, BlockLimits, TranslateError};
