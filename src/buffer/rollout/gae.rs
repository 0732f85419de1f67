//! Generalized Advantage Estimation

use tch::{Kind, Tensor};

/// Compute GAE advantages and returns
///
/// All inputs are `[T, N, 1]` except `last_values`, which holds the value
/// of the state following the final step and may be `[N, 1]` or `[N]`.
/// A done at step `t` stops bootstrapping from step `t + 1`.
///
/// # Returns
///
/// `(advantages, returns)` with `returns = advantages + values`
pub fn compute_gae(
    rewards: &Tensor,
    values: &Tensor,
    dones: &Tensor,
    last_values: &Tensor,
    gamma: f64,
    lam: f64,
) -> (Tensor, Tensor) {
    let num_steps = rewards.size()[0];
    let advantages = values.zeros_like();
    let mut next_advantage = values.get(0).zeros_like();
    let last_values = last_values.to_kind(values.kind()).reshape(values.get(0).size());

    for step in (0..num_steps).rev() {
        let next_values =
            if step == num_steps - 1 { last_values.shallow_clone() } else { values.get(step + 1) };
        let not_done = dones.get(step).neg() + 1.0;

        let delta = rewards.get(step) + &next_values * &not_done * gamma - values.get(step);
        next_advantage = delta + &not_done * &next_advantage * (gamma * lam);
        advantages.get(step).copy_(&next_advantage);
    }

    let returns = &advantages + values;
    (advantages, returns)
}

/// Normalize advantages to zero mean and unit standard deviation
///
/// Uses the population std so a single sample yields zeros instead of NaN.
pub fn normalize_advantages(advantages: &Tensor) -> Tensor {
    let mean = advantages.mean(Kind::Float);
    let std = advantages.std(false);
    (advantages - mean) / (std + 1e-8)
}
