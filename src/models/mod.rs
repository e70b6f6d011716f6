pub mod api;
pub mod invoice;

pub use api::*;
pub use invoice::*;
