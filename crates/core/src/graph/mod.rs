#![forbid(unsafe_code)]

mod arena;
mod conflict_id;
mod view;

pub use arena::*;
pub use conflict_id::*;
pub use view::*;
