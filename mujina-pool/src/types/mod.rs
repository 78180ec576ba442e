//! Value types shared across the coordinator.

mod difficulty;
mod hashrate;

pub use difficulty::Difficulty;
pub use hashrate::HashRate;
