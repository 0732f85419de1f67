//! LIPS: PPO with a style discriminator and an adaptation module
//!
//! One update interleaves three optimizers over data collected from many
//! parallel environments:
//!
//! ```text
//! For each update:
//!   1. For each epoch, for each rollout minibatch:
//!      a. Re-evaluate the policy, adapt the learning rate from the KL
//!      b. Step the clipped surrogate + value - entropy loss
//!      c. Regress the adaptation module onto the privileged state
//!   2. For each pair of (policy replay, expert) motion batches:
//!      a. Score both with the discriminator
//!      b. Step the style loss + gradient penalty
//!      c. Fold the batches into the state normalizer
//!   3. Clear rollout storage
//! ```
//!
//! # References
//!
//! - [Proximal Policy Optimization Algorithms](https://arxiv.org/abs/1707.06347)
//! - [Learning Agile Skills via Adversarial Imitation of Rough Partial Demonstrations](https://arxiv.org/abs/2206.11693)
//! - [Rapid Motor Adaptation for Legged Robots](https://arxiv.org/abs/2107.04034)

mod config;
mod loss;
mod stats;
mod trainer;

pub use config::{DiscriminatorConfig, DiscriminatorLoss, LipsConfig, Schedule};
pub use loss::{
    MAX_LEARNING_RATE, MIN_LEARNING_RATE, adapt_learning_rate, compute_adaptation_loss,
    compute_surrogate_loss, compute_value_loss,
};
pub use stats::UpdateStats;
pub use trainer::{LipsTrainer, StepInfos};
