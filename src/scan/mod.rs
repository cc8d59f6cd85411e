//! Scanning module
//!
//! This module handles:
//! - Fingerprinting files for change detection (hasher.rs)
//! - Walking library roots and diffing them against the index (scanner.rs)
//! - Driving scan batches and publishing change events (coordinator.rs)
//! - Turning filesystem notifications into rescans (watcher.rs)

pub mod coordinator;
pub mod hasher;
pub mod scanner;
pub mod watcher;
