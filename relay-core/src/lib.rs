//! Relay Core
//!
//! Core types shared by the Relay task engine and its front ends.
//!
//! This crate contains:
//! - Domain types: Task, Command, output events
//! - DTOs: Request and summary shapes for callers that serialize tasks

pub mod domain;
pub mod dto;
