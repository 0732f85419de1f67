//! Training statistics for LIPS
//!
//! Sums are accumulated per gradient step and averaged once the update
//! finishes. Each phase keeps its own step counter because the policy,
//! adaptation and discriminator loops run a different number of steps.

/// Mean losses and diagnostics from one `update()` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateStats {
    /// Value function loss
    pub value_loss: f64,

    /// Clipped surrogate loss
    pub surrogate_loss: f64,

    /// Adaptation module loss on the training split
    pub adaptation_loss: f64,

    /// Adaptation module loss on the held-out split
    pub adaptation_test_loss: f64,

    /// Discriminator loss without the gradient penalty
    pub discriminator_loss: f64,

    /// Gradient-penalty term
    pub grad_pen_loss: f64,

    /// Mean discriminator score on policy windows
    pub policy_pred: f64,

    /// Mean discriminator score on expert windows
    pub expert_pred: f64,

    /// Policy learning rate after the update
    pub learning_rate: f64,

    /// Mean policy KL over minibatches (zero with a fixed schedule)
    pub mean_kl: f64,

    /// Policy/value gradient steps taken
    pub num_policy_updates: usize,

    /// Adaptation module gradient steps taken
    pub num_adaptation_updates: usize,

    /// Discriminator gradient steps taken
    pub num_discriminator_updates: usize,
}

impl UpdateStats {
    /// Create zero-initialized statistics
    pub fn zeros() -> Self {
        Self::default()
    }

    /// Accumulate one policy/value step
    pub fn add_policy_step(&mut self, value_loss: f64, surrogate_loss: f64, kl: f64) {
        self.value_loss += value_loss;
        self.surrogate_loss += surrogate_loss;
        self.mean_kl += kl;
        self.num_policy_updates += 1;
    }

    /// Accumulate one adaptation module step
    pub fn add_adaptation_step(&mut self, train_loss: f64, test_loss: f64) {
        self.adaptation_loss += train_loss;
        self.adaptation_test_loss += test_loss;
        self.num_adaptation_updates += 1;
    }

    /// Accumulate one discriminator step
    pub fn add_discriminator_step(
        &mut self,
        discriminator_loss: f64,
        grad_pen_loss: f64,
        policy_pred: f64,
        expert_pred: f64,
    ) {
        self.discriminator_loss += discriminator_loss;
        self.grad_pen_loss += grad_pen_loss;
        self.policy_pred += policy_pred;
        self.expert_pred += expert_pred;
        self.num_discriminator_updates += 1;
    }

    /// Divide every sum by its phase's step count
    ///
    /// Phases that took no step report zero.
    pub fn average(&self) -> Self {
        let mean = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };
        let policy = self.num_policy_updates;
        let adaptation = self.num_adaptation_updates;
        let discriminator = self.num_discriminator_updates;

        Self {
            value_loss: mean(self.value_loss, policy),
            surrogate_loss: mean(self.surrogate_loss, policy),
            adaptation_loss: mean(self.adaptation_loss, adaptation),
            adaptation_test_loss: mean(self.adaptation_test_loss, adaptation),
            discriminator_loss: mean(self.discriminator_loss, discriminator),
            grad_pen_loss: mean(self.grad_pen_loss, discriminator),
            policy_pred: mean(self.policy_pred, discriminator),
            expert_pred: mean(self.expert_pred, discriminator),
            learning_rate: self.learning_rate,
            mean_kl: mean(self.mean_kl, policy),
            num_policy_updates: policy,
            num_adaptation_updates: adaptation,
            num_discriminator_updates: discriminator,
        }
    }

    /// Check that no reported value is NaN or infinite
    pub fn is_finite(&self) -> bool {
        [
            self.value_loss,
            self.surrogate_loss,
            self.adaptation_loss,
            self.adaptation_test_loss,
            self.discriminator_loss,
            self.grad_pen_loss,
            self.policy_pred,
            self.expert_pred,
            self.learning_rate,
            self.mean_kl,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}
