//! LIPS configuration and hyperparameters
//!
//! This module defines the configuration parameters for the policy,
//! adaptation-module and discriminator optimizers, and provides
//! validation and builder pattern methods.

use std::{fmt, str::FromStr};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Learning-rate schedule for the policy optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    /// Scale the rate to keep the policy KL near `desired_kl`
    #[default]
    Adaptive,
    /// Keep the initial rate
    Fixed,
}

/// Discriminator objective
///
/// Serialized under the names used by the reference configurations
/// (`"BCEWithLogitsLoss"`, `"MSELoss"`, `"WassersteinLoss"`). Any other
/// name is rejected when the configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscriminatorLoss {
    /// Binary cross-entropy on logits, expert = 1, policy = 0
    #[serde(rename = "BCEWithLogitsLoss")]
    BceWithLogits,
    /// Least-squares targets, expert = 1, policy = -1
    #[default]
    #[serde(rename = "MSELoss")]
    SquaredError,
    /// Unbounded critic scores
    #[serde(rename = "WassersteinLoss")]
    Wasserstein,
}

impl DiscriminatorLoss {
    /// Configuration name of this loss kind
    pub fn name(self) -> &'static str {
        match self {
            DiscriminatorLoss::BceWithLogits => "BCEWithLogitsLoss",
            DiscriminatorLoss::SquaredError => "MSELoss",
            DiscriminatorLoss::Wasserstein => "WassersteinLoss",
        }
    }
}

impl fmt::Display for DiscriminatorLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DiscriminatorLoss {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BCEWithLogitsLoss" => Ok(DiscriminatorLoss::BceWithLogits),
            "MSELoss" => Ok(DiscriminatorLoss::SquaredError),
            "WassersteinLoss" => Ok(DiscriminatorLoss::Wasserstein),
            other => Err(anyhow!(
                "Unexpected discriminator loss function: {:?} (expected BCEWithLogitsLoss, MSELoss or WassersteinLoss)",
                other
            )),
        }
    }
}

/// Discriminator and motion replay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    /// Discriminator learning rate
    pub learning_rate: f64,

    /// Optimizer momentum (SGD, or RMSprop for Wasserstein)
    pub momentum: f64,

    /// L2 weight decay
    pub weight_decay: f64,

    /// Gradient-penalty coefficient
    pub gradient_penalty_coef: f64,

    /// Objective used to separate policy and expert windows
    pub loss: DiscriminatorLoss,

    /// Minibatches drawn per update from each motion source
    pub num_mini_batches: usize,

    /// Capacity of the policy motion replay buffer
    pub replay_buffer_size: usize,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2.5e-5,
            momentum: 0.9,
            weight_decay: 5e-4,
            gradient_penalty_coef: 5.0,
            loss: DiscriminatorLoss::SquaredError,
            num_mini_batches: 10,
            replay_buffer_size: 100_000,
        }
    }
}

impl DiscriminatorConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(anyhow!("discriminator learning_rate must be positive"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(anyhow!("discriminator momentum must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(anyhow!("discriminator weight_decay must be non-negative"));
        }
        if self.gradient_penalty_coef < 0.0 {
            return Err(anyhow!("gradient_penalty_coef must be non-negative"));
        }
        if self.num_mini_batches == 0 {
            return Err(anyhow!("discriminator num_mini_batches must be positive"));
        }
        if self.replay_buffer_size == 0 {
            return Err(anyhow!("replay_buffer_size must be positive"));
        }
        Ok(())
    }

    /// Set learning rate
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set optimizer momentum
    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Set weight decay
    pub fn weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Set gradient-penalty coefficient
    pub fn gradient_penalty_coef(mut self, coef: f64) -> Self {
        self.gradient_penalty_coef = coef;
        self
    }

    /// Set loss kind
    pub fn loss(mut self, loss: DiscriminatorLoss) -> Self {
        self.loss = loss;
        self
    }

    /// Set number of discriminator minibatches
    pub fn num_mini_batches(mut self, n: usize) -> Self {
        self.num_mini_batches = n;
        self
    }

    /// Set replay buffer capacity
    pub fn replay_buffer_size(mut self, size: usize) -> Self {
        self.replay_buffer_size = size;
        self
    }
}

/// LIPS configuration parameters
///
/// Default values follow the quadruped locomotion settings the algorithm
/// was tuned on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LipsConfig {
    /// Value loss coefficient
    pub value_loss_coef: f64,

    /// Clip the value loss around the collection-time estimate
    pub use_clipped_value_loss: bool,

    /// PPO clipping parameter (epsilon), also used for value clipping
    pub clip_param: f64,

    /// Entropy bonus coefficient
    pub entropy_coef: f64,

    /// Passes over the rollout per update
    pub num_learning_epochs: usize,

    /// Minibatches per pass
    pub num_mini_batches: usize,

    /// Initial policy learning rate
    pub learning_rate: f64,

    /// Adaptation module learning rate
    pub adaptation_module_learning_rate: f64,

    /// Adaptation gradient steps per policy minibatch
    pub num_adaptation_module_substeps: usize,

    /// Learning-rate schedule
    pub schedule: Schedule,

    /// Discount factor
    pub gamma: f64,

    /// GAE lambda
    pub lam: f64,

    /// Target KL for the adaptive schedule; `None` disables adaptation
    pub desired_kl: Option<f64>,

    /// Maximum gradient norm for the policy optimizer
    pub max_grad_norm: f64,

    /// Privileged dimensions the adaptation loss is restricted to
    pub selective_adaptation_dims: Option<Vec<i64>>,

    /// Discriminator settings
    pub discriminator: DiscriminatorConfig,
}

impl Default for LipsConfig {
    fn default() -> Self {
        Self {
            value_loss_coef: 1.0,
            use_clipped_value_loss: true,
            clip_param: 0.2,
            entropy_coef: 0.01,
            num_learning_epochs: 5,
            num_mini_batches: 4,
            learning_rate: 1e-3,
            adaptation_module_learning_rate: 1e-3,
            num_adaptation_module_substeps: 1,
            schedule: Schedule::Adaptive,
            gamma: 0.99,
            lam: 0.95,
            desired_kl: Some(0.01),
            max_grad_norm: 1.0,
            selective_adaptation_dims: None,
            discriminator: DiscriminatorConfig::default(),
        }
    }
}

impl LipsConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse LIPS config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.value_loss_coef < 0.0 {
            return Err(anyhow!("value_loss_coef must be non-negative"));
        }
        if self.clip_param <= 0.0 {
            return Err(anyhow!("clip_param must be positive"));
        }
        if self.entropy_coef < 0.0 {
            return Err(anyhow!("entropy_coef must be non-negative"));
        }
        if self.num_learning_epochs == 0 {
            return Err(anyhow!("num_learning_epochs must be positive"));
        }
        if self.num_mini_batches == 0 {
            return Err(anyhow!("num_mini_batches must be positive"));
        }
        if self.learning_rate <= 0.0 {
            return Err(anyhow!("learning_rate must be positive"));
        }
        if self.adaptation_module_learning_rate <= 0.0 {
            return Err(anyhow!("adaptation_module_learning_rate must be positive"));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(anyhow!("gamma must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.lam) {
            return Err(anyhow!("lam must be in [0, 1]"));
        }
        if let Some(kl) = self.desired_kl {
            if kl <= 0.0 {
                return Err(anyhow!("desired_kl must be positive"));
            }
        }
        if self.max_grad_norm <= 0.0 {
            return Err(anyhow!("max_grad_norm must be positive"));
        }
        if let Some(dims) = &self.selective_adaptation_dims {
            if dims.is_empty() {
                return Err(anyhow!("selective_adaptation_dims must not be empty"));
            }
            if dims.iter().any(|&d| d < 0) {
                return Err(anyhow!("selective_adaptation_dims must be non-negative"));
            }
        }
        self.discriminator.validate()
    }

    /// Set value loss coefficient
    pub fn value_loss_coef(mut self, coef: f64) -> Self {
        self.value_loss_coef = coef;
        self
    }

    /// Enable or disable value clipping
    pub fn use_clipped_value_loss(mut self, enabled: bool) -> Self {
        self.use_clipped_value_loss = enabled;
        self
    }

    /// Set PPO clipping parameter
    pub fn clip_param(mut self, clip: f64) -> Self {
        self.clip_param = clip;
        self
    }

    /// Set entropy bonus coefficient
    pub fn entropy_coef(mut self, coef: f64) -> Self {
        self.entropy_coef = coef;
        self
    }

    /// Set number of learning epochs
    pub fn num_learning_epochs(mut self, epochs: usize) -> Self {
        self.num_learning_epochs = epochs;
        self
    }

    /// Set number of minibatches per epoch
    pub fn num_mini_batches(mut self, n: usize) -> Self {
        self.num_mini_batches = n;
        self
    }

    /// Set policy learning rate
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set adaptation module learning rate
    pub fn adaptation_module_learning_rate(mut self, lr: f64) -> Self {
        self.adaptation_module_learning_rate = lr;
        self
    }

    /// Set adaptation substeps per minibatch
    pub fn num_adaptation_module_substeps(mut self, n: usize) -> Self {
        self.num_adaptation_module_substeps = n;
        self
    }

    /// Set learning-rate schedule
    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Set discount factor
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Set GAE lambda
    pub fn lam(mut self, lam: f64) -> Self {
        self.lam = lam;
        self
    }

    /// Set target KL divergence
    pub fn desired_kl(mut self, kl: Option<f64>) -> Self {
        self.desired_kl = kl;
        self
    }

    /// Set maximum gradient norm
    pub fn max_grad_norm(mut self, norm: f64) -> Self {
        self.max_grad_norm = norm;
        self
    }

    /// Restrict the adaptation loss to a subset of privileged dimensions
    pub fn selective_adaptation_dims(mut self, dims: Option<Vec<i64>>) -> Self {
        self.selective_adaptation_dims = dims;
        self
    }

    /// Set discriminator configuration
    pub fn discriminator(mut self, config: DiscriminatorConfig) -> Self {
        self.discriminator = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LipsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.num_learning_epochs, 5);
        assert_eq!(config.num_mini_batches, 4);
        assert_eq!(config.discriminator.loss, DiscriminatorLoss::SquaredError);
        assert_eq!(config.discriminator.num_mini_batches, 10);
    }

    #[test]
    fn test_config_validation() {
        assert!(LipsConfig::new().learning_rate(-1.0).validate().is_err());
        assert!(LipsConfig::new().gamma(1.5).validate().is_err());
        assert!(LipsConfig::new().num_learning_epochs(0).validate().is_err());
        assert!(LipsConfig::new().num_mini_batches(0).validate().is_err());
        assert!(LipsConfig::new().clip_param(-0.1).validate().is_err());
        assert!(LipsConfig::new().desired_kl(Some(0.0)).validate().is_err());
        assert!(LipsConfig::new().selective_adaptation_dims(Some(vec![])).validate().is_err());

        let bad_disc = DiscriminatorConfig::new().num_mini_batches(0);
        assert!(LipsConfig::new().discriminator(bad_disc).validate().is_err());

        // Zero coefficients are allowed
        assert!(LipsConfig::new().value_loss_coef(0.0).entropy_coef(0.0).validate().is_ok());
        assert!(LipsConfig::new().desired_kl(None).validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = LipsConfig::new()
            .learning_rate(5e-4)
            .num_mini_batches(2)
            .schedule(Schedule::Fixed)
            .discriminator(DiscriminatorConfig::new().loss(DiscriminatorLoss::Wasserstein));

        assert_eq!(config.learning_rate, 5e-4);
        assert_eq!(config.num_mini_batches, 2);
        assert_eq!(config.schedule, Schedule::Fixed);
        assert_eq!(config.discriminator.loss, DiscriminatorLoss::Wasserstein);

        // Other values should remain default
        assert_eq!(config.gamma, 0.99);
        assert_eq!(config.discriminator.gradient_penalty_coef, 5.0);
    }

    #[test]
    fn test_loss_kind_from_str() {
        assert_eq!("BCEWithLogitsLoss".parse::<DiscriminatorLoss>().unwrap(), DiscriminatorLoss::BceWithLogits);
        assert_eq!("MSELoss".parse::<DiscriminatorLoss>().unwrap(), DiscriminatorLoss::SquaredError);
        assert_eq!("WassersteinLoss".parse::<DiscriminatorLoss>().unwrap(), DiscriminatorLoss::Wasserstein);
        assert!("HingeLoss".parse::<DiscriminatorLoss>().is_err());
        assert_eq!(DiscriminatorLoss::Wasserstein.to_string(), "WassersteinLoss");
    }

    #[test]
    fn test_from_json() {
        let config = LipsConfig::from_json(
            r#"{"learning_rate": 0.0005, "schedule": "fixed", "discriminator": {"loss": "BCEWithLogitsLoss"}}"#,
        )
        .unwrap();

        assert_eq!(config.learning_rate, 5e-4);
        assert_eq!(config.schedule, Schedule::Fixed);
        assert_eq!(config.discriminator.loss, DiscriminatorLoss::BceWithLogits);
        assert_eq!(config.discriminator.num_mini_batches, 10);
    }

    #[test]
    fn test_from_json_rejects_unknown_loss() {
        let err = LipsConfig::from_json(r#"{"discriminator": {"loss": "HingeLoss"}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_from_json_validates() {
        assert!(LipsConfig::from_json(r#"{"gamma": 2.0}"#).is_err());
    }
}
