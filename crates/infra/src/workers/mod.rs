//! Background threads.

pub mod sweeper;

pub use sweeper::{Sweeper, SweeperHandle, SweeperStats};
