pub mod config;
pub mod context;
pub mod framing;
pub mod hashing;
pub mod key;
pub mod position;
pub mod snippet;
