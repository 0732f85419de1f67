//! Policy and discriminator contracts
//!
//! The trainer treats networks as opaque function approximators. It only
//! relies on the two traits below, plus the variable stores used to bind
//! optimizers. An actor-critic keeps its adaptation module in the same
//! store as the actor and critic, under its own optimizer group. `mlp` and `discriminator` provide small reference
//! implementations built with tch-rs.

use anyhow::{Result, anyhow};
use tch::{Tensor, nn};

pub mod discriminator;
pub mod distribution;
pub mod mlp;

pub use discriminator::MlpDiscriminator;
pub use distribution::DiagGaussian;
pub use mlp::{Activation, MlpActorCritic, MlpConfig};

/// Optimizer group of the adaptation-module parameters
pub const ADAPTATION_GROUP: usize = 1;

/// Actor-critic with an adaptation-module side branch
///
/// `act` records the action distribution it sampled from. The
/// log-probability, mean, std and entropy accessors read that recorded
/// state, mirroring how the update loop re-evaluates a minibatch and then
/// queries the distribution.
pub trait ActorCritic {
    /// Sample actions for a batch of observation histories
    fn act(&mut self, obs_history: &Tensor, masks: Option<&Tensor>) -> Tensor;

    /// Deterministic (mean) actions
    fn act_inference(&self, obs_history: &Tensor) -> Tensor;

    /// Value estimates, shaped `[B, 1]`
    fn evaluate(
        &self,
        obs_history: &Tensor,
        privileged_obs: &Tensor,
        masks: Option<&Tensor>,
    ) -> Tensor;

    /// Distribution recorded by the last `act` call
    fn distribution(&self) -> Option<&DiagGaussian>;

    /// Predict privileged observations from observation history
    fn adaptation_module(&self, obs_history: &Tensor) -> Tensor;

    /// Reset recurrent state for finished environments
    fn reset(&mut self, _dones: &Tensor) {}

    /// Whether minibatches must keep time contiguity
    fn is_recurrent(&self) -> bool {
        false
    }

    /// Switch between training and evaluation behaviour
    fn set_train(&mut self, _train: bool) {}

    /// All parameters: actor, critic and adaptation module
    ///
    /// The policy optimizer steps every variable in this store. The
    /// adaptation optimizer only moves the `adaptation_group()` variables.
    fn var_store(&self) -> &nn::VarStore;

    /// Optimizer group holding the adaptation-module variables
    fn adaptation_group(&self) -> usize {
        ADAPTATION_GROUP
    }

    /// Log-probability of `actions` under the last distribution
    fn get_actions_log_prob(&self, actions: &Tensor) -> Result<Tensor> {
        Ok(last_distribution(self)?.log_prob(actions))
    }

    /// Mean of the last distribution
    fn action_mean(&self) -> Result<Tensor> {
        Ok(last_distribution(self)?.mean().shallow_clone())
    }

    /// Standard deviation of the last distribution
    fn action_std(&self) -> Result<Tensor> {
        Ok(last_distribution(self)?.std().shallow_clone())
    }

    /// Entropy of the last distribution, one value per sample
    fn entropy(&self) -> Result<Tensor> {
        Ok(last_distribution(self)?.entropy())
    }
}

fn last_distribution<A: ActorCritic + ?Sized>(actor_critic: &A) -> Result<&DiagGaussian> {
    actor_critic
        .distribution()
        .ok_or_else(|| anyhow!("No action distribution recorded. Call act() first."))
}

/// Style discriminator over flattened motion windows
pub trait Discriminator {
    /// Score flattened `[B, horizon * obs_dim]` windows, returning `[B, 1]`
    fn forward(&self, flat_windows: &Tensor) -> Tensor;

    /// Gradient penalty on expert windows shaped `[B, horizon, obs_dim]`
    fn compute_grad_pen(&self, expert_windows: &Tensor, lambda: f64) -> Tensor;

    /// Per-step feature dimension of a motion window
    fn observation_dim(&self) -> i64;

    /// Number of steps in a motion window
    fn observation_horizon(&self) -> i64;

    /// Discriminator parameters
    fn var_store(&self) -> &nn::VarStore;

    /// Switch between training and evaluation behaviour
    fn set_train(&mut self, _train: bool) {}
}
