pub mod fixtures;
pub mod slow;

#[allow(unused_imports)]
pub use fixtures::{seeded_bytes, sha256_hex, split_chunks};
#[allow(unused_imports)]
pub use slow::SlowBackend;
