pub mod endpoint;
pub mod result;
pub mod task;

pub use endpoint::*;
pub use result::*;
pub use task::*;
