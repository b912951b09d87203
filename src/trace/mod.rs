pub mod discover;
pub mod mtr;
pub mod probe;

pub use discover::*;
pub use mtr::*;
pub use probe::*;
