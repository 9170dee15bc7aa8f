pub mod block;
pub mod bunch;

pub use block::*;
pub use bunch::*;
