pub mod const_fold;
pub mod dead_code;
pub mod dead_flags;
