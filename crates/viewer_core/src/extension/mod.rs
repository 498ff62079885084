//! Extension declaration and loading.
//!
//! # Responsibility
//! - Describe extensions, their dependencies and their capability providers.
//! - Order, stage and commit extension contributions into a runtime.
//!
//! # Invariants
//! - Providers run in capability factory order within one extension.
//! - Contributions of one extension become visible all at once or not at all.

pub mod capability;
pub mod graph;
pub mod loader;
pub mod manifest;
pub mod provider;
pub mod version;
