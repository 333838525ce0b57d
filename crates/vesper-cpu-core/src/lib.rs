//! Guest-thread execution context shared between the translator and the
//! host integration layer.
//!
//! This crate holds the architectural state (`CpuState`) and the exit
//! vocabulary (`ExitReason`, `PendingException`) and deliberately nothing
//! else: the translator depends on it for the context layout, the embedder
//! depends on it for register access around service calls, and neither
//! pulls in the other.

#![forbid(unsafe_code)]

mod state;

pub use state::{
    CpuState, ExitReason, PendingException, PSTATE_C, PSTATE_N, PSTATE_V, PSTATE_Z, SPILL_SLOTS,
};
