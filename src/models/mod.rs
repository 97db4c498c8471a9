//! Core data models of the skin depot.
//!
//! Skins are identified by the id of their database row; that id also names
//! their folder in the storage tree. The freshness token summarises the
//! state of the whole collection for the bulk bundle cache.

pub mod skin;
pub mod token;
