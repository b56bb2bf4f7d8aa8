//! Transactional entry points for the reconciliation core

pub mod core;

pub use core::*;
