//! Training algorithms
//!
//! This module implements the LIPS update: PPO with an adversarial style
//! reward and a supervised adaptation module.

pub mod lips;

pub use lips::{
    DiscriminatorConfig, DiscriminatorLoss, LipsConfig, LipsTrainer, Schedule, StepInfos,
    UpdateStats, adapt_learning_rate, compute_surrogate_loss, compute_value_loss,
};
