//! Dead code removal.
//!
//! Single reverse scan: in straight-line SSA every use appears after its
//! definition, so walking backwards sees all uses of a value before its
//! defining operation. Operations with no side effect and a dead (or no)
//! destination are dropped. Loads are side-effecting here: removing one
//! would remove its potential fault.

use crate::ir::IrBlock;

pub fn run(block: &mut IrBlock) -> bool {
    let mut used = vec![false; block.value_count as usize];
    block.term.for_each_use(|v| used[v.0 as usize] = true);

    let mut keep = vec![true; block.ops.len()];
    for (i, op) in block.ops.iter().enumerate().rev() {
        let live = op.has_side_effect() || op.dst().is_some_and(|d| used[d.0 as usize]);
        if live {
            op.for_each_use(|v| used[v.0 as usize] = true);
        } else {
            keep[i] = false;
        }
    }

    if keep.iter().all(|&k| k) {
        return false;
    }
    let mut i = 0;
    block.ops.retain(|_| {
        let k = keep[i];
        i += 1;
        k
    });
    true
}
