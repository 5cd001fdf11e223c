//! Core domain types
//!
//! These types are shared between the engine (which mutates tasks) and
//! front ends (which render or serialize them).

pub mod output;
pub mod task;
