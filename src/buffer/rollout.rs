//! Rollout storage for storing and processing trajectories
//!
//! This module implements on-policy experience storage, including:
//! - Per-step transition storage across parallel environments
//! - GAE (Generalized Advantage Estimation) computation
//! - Shuffled and environment-contiguous minibatch generation
//!
//! # Buffer Layout
//!
//! Every field is a preallocated `[num_transitions_per_env, num_envs, ...]`
//! tensor. A fill pointer advances one time slot per `add_transitions`
//! call; `clear` rewinds it without touching the allocation.

mod gae;
mod sampling;
mod storage;

#[cfg(test)]
mod tests;

pub use gae::{compute_gae, normalize_advantages};
pub use sampling::{
    Minibatch, MinibatchGenerator, RecurrentMinibatchGenerator, split_and_pad_trajectories,
    unpad_trajectories,
};
pub use storage::{RolloutStorage, Transition};
