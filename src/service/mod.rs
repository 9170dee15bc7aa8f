pub mod node;
pub mod registry;
pub mod skipchain;

pub use node::*;
pub use registry::*;
pub use skipchain::*;
