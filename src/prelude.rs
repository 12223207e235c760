pub use parskel_core::prelude::*;
pub use parskel_core::util::{div_ceil, round_up};
pub use parskel_core::Element;
