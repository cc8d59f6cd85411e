//! Thumbnail module
//!
//! This module handles:
//! - Picking a preview source and rendering thumbnails (pipeline.rs)
//! - Drawing extension-labelled placeholders (placeholder.rs)
//! - Caching thumbnails to disk by content key (store.rs)

pub mod pipeline;
pub mod placeholder;
pub mod store;
