mod element;
pub mod prelude;
pub mod util;

pub use element::*;
