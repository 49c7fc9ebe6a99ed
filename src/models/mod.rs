pub mod photo;
pub mod quality;
pub mod registry;

pub use photo::*;
pub use quality::*;
pub use registry::*;
