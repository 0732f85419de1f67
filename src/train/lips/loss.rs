//! Loss computation functions for LIPS
//!
//! This module contains the PPO surrogate and value losses, the adaptive
//! learning-rate rule, the supervised adaptation-module loss, and the
//! per-kind discriminator objectives and style rewards.

use tch::{Kind, Reduction, Tensor};

use super::config::DiscriminatorLoss;

/// Lower bound for the adaptive learning rate
pub const MIN_LEARNING_RATE: f64 = 1e-5;

/// Upper bound for the adaptive learning rate
pub const MAX_LEARNING_RATE: f64 = 1e-2;

/// Compute the clipped PPO surrogate loss
///
/// `mean(max(-A * ratio, -A * clip(ratio, 1 - eps, 1 + eps)))` with
/// `ratio = exp(log_probs - old_log_probs)`. Inputs are flattened, so
/// `[B]` and `[B, 1]` layouts can be mixed.
pub fn compute_surrogate_loss(
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    advantages: &Tensor,
    clip_param: f64,
) -> Tensor {
    let advantages = advantages.reshape([-1]);
    let ratio = (log_probs.reshape([-1]) - old_log_probs.reshape([-1])).exp();

    let surrogate = -&advantages * &ratio;
    let surrogate_clipped = -&advantages * ratio.clamp(1.0 - clip_param, 1.0 + clip_param);
    surrogate.maximum(&surrogate_clipped).mean(Kind::Float)
}

/// Compute value function loss with optional clipping
///
/// # Arguments
/// * `values` - Predicted values under the current critic
/// * `target_values` - Values recorded during collection
/// * `returns` - GAE return targets
/// * `clip_param` - Clip range around `target_values`; `None` gives plain MSE
pub fn compute_value_loss(
    values: &Tensor,
    target_values: &Tensor,
    returns: &Tensor,
    clip_param: Option<f64>,
) -> Tensor {
    match clip_param {
        Some(clip) => {
            let value_clipped = target_values + (values - target_values).clamp(-clip, clip);
            let value_losses = (values - returns).square();
            let value_losses_clipped = (value_clipped - returns).square();
            value_losses.maximum(&value_losses_clipped).mean(Kind::Float)
        }
        None => (returns - values).square().mean(Kind::Float),
    }
}

/// Adjust the learning rate from the measured policy KL
///
/// Divides by 1.5 once `mean_kl` reaches twice the target and multiplies
/// by 1.5 when it drops below half the target. The result is clamped to
/// [`MIN_LEARNING_RATE`, `MAX_LEARNING_RATE`]; in between the rate is
/// returned unchanged.
pub fn adapt_learning_rate(learning_rate: f64, mean_kl: f64, desired_kl: f64) -> f64 {
    if mean_kl >= desired_kl * 2.0 {
        MIN_LEARNING_RATE.max(learning_rate / 1.5)
    } else if mean_kl > 0.0 && mean_kl < desired_kl / 2.0 {
        MAX_LEARNING_RATE.min(learning_rate * 1.5)
    } else {
        learning_rate
    }
}

fn mse_over(pred: &Tensor, target: &Tensor) -> Tensor {
    if pred.numel() == 0 {
        return Tensor::from(0f32).to_device(pred.device());
    }
    pred.mse_loss(target, Reduction::Mean)
}

/// Compute the adaptation-module regression loss
///
/// The first `num_train` rows form the training split and the rest the
/// held-out split. When `dims` is set only those output columns count.
/// An empty split yields a constant zero.
///
/// # Returns
/// (train_loss, test_loss); the test loss carries no gradient
pub fn compute_adaptation_loss(
    prediction: &Tensor,
    target: &Tensor,
    num_train: i64,
    dims: Option<&[i64]>,
) -> (Tensor, Tensor) {
    let (prediction, target) = match dims {
        Some(dims) => {
            let index = Tensor::from_slice(dims).to_device(prediction.device());
            (prediction.index_select(1, &index), target.index_select(1, &index))
        }
        None => (prediction.shallow_clone(), target.shallow_clone()),
    };

    let n = prediction.size()[0];
    let num_train = num_train.clamp(0, n);

    let train_loss =
        mse_over(&prediction.narrow(0, 0, num_train), &target.narrow(0, 0, num_train));
    let num_test = n - num_train;
    let test_loss = tch::no_grad(|| {
        mse_over(&prediction.narrow(0, num_train, num_test), &target.narrow(0, num_train, num_test))
    });
    (train_loss, test_loss)
}

impl DiscriminatorLoss {
    /// Compute the expert and policy terms of the discriminator loss
    ///
    /// # Returns
    /// (expert_loss, policy_loss)
    pub fn compute(self, expert_d: &Tensor, policy_d: &Tensor) -> (Tensor, Tensor) {
        match self {
            DiscriminatorLoss::BceWithLogits => (
                expert_d.binary_cross_entropy_with_logits::<Tensor>(
                    &expert_d.ones_like(),
                    None,
                    None,
                    Reduction::Mean,
                ),
                policy_d.binary_cross_entropy_with_logits::<Tensor>(
                    &policy_d.zeros_like(),
                    None,
                    None,
                    Reduction::Mean,
                ),
            ),
            DiscriminatorLoss::SquaredError => (
                expert_d.mse_loss(&expert_d.ones_like(), Reduction::Mean),
                policy_d.mse_loss(&policy_d.ones_like().neg(), Reduction::Mean),
            ),
            DiscriminatorLoss::Wasserstein => {
                (-expert_d.mean(Kind::Float), policy_d.mean(Kind::Float))
            }
        }
    }

    /// Map raw discriminator scores to a per-sample style reward
    ///
    /// Wasserstein scores are returned as is; callers normalize them.
    pub fn style_reward(self, d: &Tensor) -> Tensor {
        match self {
            DiscriminatorLoss::BceWithLogits => {
                -(d.sigmoid().neg() + 1.0).clamp_min(1e-4).log()
            }
            DiscriminatorLoss::SquaredError => {
                ((d - 1.0).square() * -0.25 + 1.0).clamp_min(0.0)
            }
            DiscriminatorLoss::Wasserstein => d.shallow_clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn scalar(t: &Tensor) -> f64 {
        f64::try_from(t).unwrap()
    }

    #[test]
    fn test_surrogate_at_unit_ratio_is_negative_mean_advantage() {
        let log_probs = Tensor::from_slice(&[-0.3f32, -1.2, -0.7, -2.0]);
        let advantages = Tensor::from_slice(&[1.0f32, -2.0, 0.5, 3.0]).reshape([4, 1]);

        for clip in [0.05, 0.2, 0.5] {
            let loss = compute_surrogate_loss(&log_probs, &log_probs.reshape([4, 1]), &advantages, clip);
            assert!((scalar(&loss) + 0.625).abs() < 1e-6, "clip {} gave {}", clip, scalar(&loss));
        }
    }

    #[test]
    fn test_surrogate_clips_large_ratio() {
        // ratio = e for a positive advantage: the clipped term wins
        let log_probs = Tensor::from_slice(&[1.0f32]);
        let old = Tensor::from_slice(&[0.0f32]);
        let advantages = Tensor::from_slice(&[1.0f32]);

        let loss = compute_surrogate_loss(&log_probs, &old, &advantages, 0.2);
        assert!((scalar(&loss) + 1.2).abs() < 1e-6);
    }

    #[test]
    fn test_unclipped_value_loss_is_mse() {
        let values = Tensor::from_slice(&[1.0f32, 2.0, 3.0]).reshape([3, 1]);
        let targets = Tensor::from_slice(&[5.0f32, 5.0, 5.0]).reshape([3, 1]);
        let returns = Tensor::from_slice(&[0.0f32, 2.0, 5.0]).reshape([3, 1]);

        let loss = compute_value_loss(&values, &targets, &returns, None);
        assert!((scalar(&loss) - 5.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_clipped_value_loss_takes_pessimistic_term() {
        // Clipped prediction is 0.2 away from the old value 0, further from the return
        let values = Tensor::from_slice(&[1.0f32]);
        let targets = Tensor::from_slice(&[0.0f32]);
        let returns = Tensor::from_slice(&[1.0f32]);

        let loss = compute_value_loss(&values, &targets, &returns, Some(0.2));
        assert!((scalar(&loss) - 0.64).abs() < 1e-6);
    }

    #[test]
    fn test_adapt_learning_rate() {
        let target = 0.01;

        assert_eq!(adapt_learning_rate(1e-3, 2.0 * target, target), 1e-3 / 1.5);
        assert_eq!(adapt_learning_rate(1e-3, target / 4.0, target), 1e-3 * 1.5);
        assert_eq!(adapt_learning_rate(1e-3, target, target), 1e-3);
        assert_eq!(adapt_learning_rate(1e-3, 0.0, target), 1e-3);

        // Floor and ceiling
        assert_eq!(adapt_learning_rate(1.2e-5, 1.0, target), MIN_LEARNING_RATE);
        assert_eq!(adapt_learning_rate(9e-3, 1e-4, target), MAX_LEARNING_RATE);
    }

    #[test]
    fn test_squared_error_loss_at_targets_is_zero() {
        let expert_d = Tensor::ones([6, 1], (Kind::Float, Device::Cpu));
        let policy_d = Tensor::ones([6, 1], (Kind::Float, Device::Cpu)).neg();

        let (expert_loss, policy_loss) = DiscriminatorLoss::SquaredError.compute(&expert_d, &policy_d);
        assert_eq!(scalar(&expert_loss), 0.0);
        assert_eq!(scalar(&policy_loss), 0.0);
    }

    #[test]
    fn test_bce_loss_at_zero_logits() {
        let zeros = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        let (expert_loss, policy_loss) = DiscriminatorLoss::BceWithLogits.compute(&zeros, &zeros);

        assert!((scalar(&expert_loss) - 2f64.ln()).abs() < 1e-6);
        assert!((scalar(&policy_loss) - 2f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_wasserstein_loss() {
        let expert_d = Tensor::from_slice(&[1.0f32, 3.0]);
        let policy_d = Tensor::from_slice(&[-1.0f32, 0.0]);

        let (expert_loss, policy_loss) = DiscriminatorLoss::Wasserstein.compute(&expert_d, &policy_d);
        assert_eq!(scalar(&expert_loss), -2.0);
        assert_eq!(scalar(&policy_loss), -0.5);
    }

    #[test]
    fn test_style_rewards() {
        let d = Tensor::from_slice(&[1.0f32, -1.0, 5.0]);

        let mse: Vec<f32> = Vec::try_from(&DiscriminatorLoss::SquaredError.style_reward(&d)).unwrap();
        assert_eq!(mse, vec![1.0, 0.0, 0.0]);

        let logits = Tensor::from_slice(&[0.0f32, 50.0]);
        let bce: Vec<f32> =
            Vec::try_from(&DiscriminatorLoss::BceWithLogits.style_reward(&logits)).unwrap();
        assert!((bce[0] - 2f32.ln()).abs() < 1e-6);
        assert!((bce[1] - 1e-4f32.ln().abs()).abs() < 1e-3);
    }

    #[test]
    fn test_adaptation_loss_split() {
        let prediction = Tensor::zeros([10, 2], (Kind::Float, Device::Cpu));
        let target = Tensor::cat(
            &[
                Tensor::ones([8, 2], (Kind::Float, Device::Cpu)),
                Tensor::full([2, 2], 3.0, (Kind::Float, Device::Cpu)),
            ],
            0,
        );

        let (train, test) = compute_adaptation_loss(&prediction, &target, 10 / 5 * 4, None);
        assert_eq!(scalar(&train), 1.0);
        assert_eq!(scalar(&test), 9.0);
    }

    #[test]
    fn test_selective_adaptation_dims() {
        let prediction = Tensor::zeros([5, 3], (Kind::Float, Device::Cpu));
        let target = Tensor::from_slice(&[0.0f32, 2.0, 4.0]).repeat([5, 1]);

        let (train, _) = compute_adaptation_loss(&prediction, &target, 4, Some(&[1]));
        assert_eq!(scalar(&train), 4.0);
    }

    #[test]
    fn test_adaptation_loss_empty_test_split() {
        let prediction = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        let (_, test) = compute_adaptation_loss(&prediction, &prediction, 4, None);
        assert_eq!(scalar(&test), 0.0);
    }
}
