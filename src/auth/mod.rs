//! Authentication: token verification behind the `TokenVerifier` seam

pub mod token;

pub use token::{Claims, TokenManager, TokenVerifier};
