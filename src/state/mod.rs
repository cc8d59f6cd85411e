//! State management module
//!
//! This module handles all persistent library state, including:
//! - Database connections and queries (library.rs)
//! - Shared data structures (data.rs)

pub mod data;
pub mod library;
