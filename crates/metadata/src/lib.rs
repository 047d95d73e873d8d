//! Metadata store abstraction and implementations for Quire.
//!
//! This crate provides the control-plane state:
//! - Upload sessions and their received-chunk sets
//! - Generation tasks, their stage and progress
//!
//! All state changes that depend on the current state are compare-and-set
//! operations returning [`Transition`].

pub mod error;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult, Transition};
pub use repos::{ChunkMark, SessionUpdate, TaskRepo, TaskUpdate, UploadRepo};
pub use store::{MemoryStore, MetadataStore};
