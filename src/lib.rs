//! # lips-rl
//!
//! PPO with an adversarial style reward and online system identification
//!
//! The crate trains a Gaussian actor-critic on rollouts from many parallel
//! environments while a discriminator learns to tell policy motion from
//! expert motion, and an adaptation module learns to predict privileged
//! environment parameters from the observation history. Networks and
//! optimizers run on PyTorch via tch-rs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lips_rl::prelude::*;
//! use tch::Device;
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = Device::Cpu;
//! let policy = MlpActorCritic::with_config(12, 3, 4, MlpConfig::default(), device);
//! let discriminator = MlpDiscriminator::new(6, 2, 64, device);
//! let expert = ExpertMotionData::new(tch::Tensor::randn([256, 2, 6], (tch::Kind::Float, device)))?;
//!
//! let mut trainer = LipsTrainer::new(LipsConfig::default(), policy, discriminator, expert, device)?;
//! trainer.init_storage(16, 24, &[12], &[3], &[12], &[4]);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

/// Rollout storage and motion replay buffers
pub mod buffer;

/// Actor-critic and discriminator contracts with MLP implementations
pub mod policy;

/// Training algorithms (LIPS)
pub mod train;

/// Utility functions and helpers
pub mod utils;

/// Prelude module for convenient imports
///
/// This module re-exports commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::buffer::{ExpertMotionData, MotionSource, ReplayBuffer, RolloutStorage, Transition};
    pub use crate::policy::{ActorCritic, Discriminator, MlpActorCritic, MlpConfig, MlpDiscriminator};
    pub use crate::train::{
        DiscriminatorConfig, DiscriminatorLoss, LipsConfig, LipsTrainer, Schedule, StepInfos,
        UpdateStats,
    };
    pub use crate::utils::RunningMeanStd;
}

/// Current version of lips-rl
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
