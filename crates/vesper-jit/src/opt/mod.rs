//! Block-local IR optimization.
//!
//! Three passes over the straight-line SSA form, run to a fixpoint:
//! constant folding, dead flag-write elimination, and dead code removal.
//! Each pass reports whether it changed the block; the driver loops until
//! nothing moves (bounded, since every pass only removes or simplifies).

pub mod passes;

use crate::ir::IrBlock;

/// Which passes to run. Disabling all of them yields the unoptimized block
/// the differential tests compare against.
#[derive(Clone, Copy, Debug)]
pub struct OptConfig {
    pub const_fold: bool,
    pub dead_flags: bool,
    pub dead_code: bool,
}

impl Default for OptConfig {
    fn default() -> Self {
        OptConfig {
            const_fold: true,
            dead_flags: true,
            dead_code: true,
        }
    }
}

impl OptConfig {
    pub fn none() -> Self {
        OptConfig {
            const_fold: false,
            dead_flags: false,
            dead_code: false,
        }
    }
}

const MAX_PASS_ITERATIONS: usize = 8;

pub fn optimize(block: &mut IrBlock, config: &OptConfig) {
    for _ in 0..MAX_PASS_ITERATIONS {
        let mut changed = false;
        if config.const_fold {
            changed |= passes::const_fold::run(block);
        }
        if config.dead_flags {
            changed |= passes::dead_flags::run(block);
        }
        if config.dead_code {
            changed |= passes::dead_code::run(block);
        }
        if !changed {
            break;
        }
    }
    debug_assert_eq!(block.validate(), Ok(()));
}
