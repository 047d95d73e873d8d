//! HTTP request handlers.

pub mod capabilities;
pub mod events;
pub mod health;
pub mod tasks;
pub mod uploads;

pub use capabilities::*;
pub use events::*;
pub use health::*;
pub use tasks::*;
pub use uploads::*;
