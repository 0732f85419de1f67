//! MLP style discriminator
//!
//! Scores flattened motion windows. Higher scores mean "looks like the
//! expert". The gradient penalty is zero-centred: it pushes the input
//! gradient norm on expert samples towards zero, which keeps the
//! discriminator smooth around the reference data.

use tch::{
    Device, Kind, Tensor,
    nn::{self, Module},
};

use super::{Discriminator, mlp::{Activation, build_mlp}};

/// Feed-forward discriminator over `[horizon * obs_dim]` inputs
pub struct MlpDiscriminator {
    vs: nn::VarStore,
    trunk: nn::Sequential,
    observation_dim: i64,
    observation_horizon: i64,
}

impl MlpDiscriminator {
    /// Create a new discriminator
    ///
    /// # Arguments
    ///
    /// * `observation_dim` - Per-step feature size of a motion window
    /// * `observation_horizon` - Number of steps in a motion window
    /// * `hidden_dim` - Width of the two hidden layers
    /// * `device` - Device for the parameters
    pub fn new(observation_dim: i64, observation_horizon: i64, hidden_dim: i64, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let trunk = build_mlp(
            &vs.root() / "discriminator",
            observation_dim * observation_horizon,
            hidden_dim,
            2,
            1,
            Activation::ReLU,
            true,
            1.0,
        );
        Self { vs, trunk, observation_dim, observation_horizon }
    }
}

impl Discriminator for MlpDiscriminator {
    fn forward(&self, flat_windows: &Tensor) -> Tensor {
        self.trunk.forward(flat_windows)
    }

    fn compute_grad_pen(&self, expert_windows: &Tensor, lambda: f64) -> Tensor {
        let input = expert_windows.flatten(1, 2).detach().set_requires_grad(true);
        let scores = self.forward(&input);
        let grads = Tensor::run_backward(&[&scores.sum(Kind::Float)], &[&input], true, true);
        let grad_sq_norm = grads[0].square().sum_dim_intlist(-1, false, Kind::Float);
        grad_sq_norm.mean(Kind::Float) * lambda
    }

    fn observation_dim(&self) -> i64 {
        self.observation_dim
    }

    fn observation_horizon(&self) -> i64 {
        self.observation_horizon
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}
