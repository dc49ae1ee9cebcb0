pub mod planner;

pub use planner::{group_sort_mode, resolve};
