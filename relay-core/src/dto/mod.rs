//! Data Transfer Objects
//!
//! Lightweight request and listing shapes for callers that sit in front of
//! the engine (CLI, HTTP layers, push transports).

pub mod task;
