pub mod repository;
pub mod store;

pub use repository::*;
pub use store::*;
