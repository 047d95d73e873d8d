//! Repository traits for metadata operations.

pub mod tasks;
pub mod uploads;

pub use tasks::{TaskRepo, TaskUpdate};
pub use uploads::{ChunkMark, SessionUpdate, UploadRepo};
