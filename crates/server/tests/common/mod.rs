//! Common test utilities and fixtures.

pub mod fixtures;
pub mod generators;
pub mod server;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use generators::*;
#[allow(unused_imports)]
pub use server::*;
