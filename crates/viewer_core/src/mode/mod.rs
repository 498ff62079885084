//! Modes: workflow presets composed from extensions.
//!
//! # Responsibility
//! - Declare and validate modes.
//! - Switch the runtime between modes.

pub mod composer;
pub mod descriptor;
