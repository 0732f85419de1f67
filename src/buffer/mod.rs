//! Experience buffers
//!
//! - `rollout`: on-policy transition storage with GAE and minibatching
//! - `replay`: motion-window buffers for the style discriminator

pub mod replay;
pub mod rollout;

pub use replay::{ExpertMotionData, MotionBatches, MotionSource, ReplayBuffer};
pub use rollout::{Minibatch, RolloutStorage, Transition};
