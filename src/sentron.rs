pub mod measurement;
pub mod register_map;

pub use measurement::*;
pub use register_map::*;
