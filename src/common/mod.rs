pub mod crypto;
pub mod roster;

pub use crypto::*;
pub use roster::*;
