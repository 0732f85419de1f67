//! LIPS trainer implementation
//!
//! This module contains the `LipsTrainer` struct: collection bookkeeping
//! (`act`, `process_env_step`, `compute_returns`) and the three-phase
//! update.

use anyhow::{Context, Result, anyhow, bail};
use tch::{
    Device, Kind, Tensor,
    nn::{self, OptimizerConfig},
};

use super::{
    config::{DiscriminatorLoss, LipsConfig, Schedule},
    loss::{adapt_learning_rate, compute_adaptation_loss, compute_surrogate_loss, compute_value_loss},
    stats::UpdateStats,
};
use crate::{
    buffer::{
        Minibatch, MotionSource, ReplayBuffer, RolloutStorage, Transition,
        replay::check_window_shape,
    },
    policy::{ActorCritic, DiagGaussian, Discriminator},
    utils::RunningMeanStd,
};

/// Extra per-step environment signals
#[derive(Debug, Default)]
pub struct StepInfos {
    /// Environment-bin labels [num_envs]
    pub env_bins: Option<Tensor>,

    /// Episode truncation flags [num_envs]; a truncated step is
    /// bootstrapped with `gamma * V(s)`
    pub time_outs: Option<Tensor>,
}

/// LIPS trainer for policy, adaptation module and style discriminator
///
/// Owns the three optimizers, the rollout storage, the policy-side motion
/// replay buffer and the optional running normalizers.
pub struct LipsTrainer<A, D, E> {
    config: LipsConfig,
    actor_critic: A,
    discriminator: D,
    expert_data: E,
    policy_data: ReplayBuffer,
    state_normalizer: Option<RunningMeanStd>,
    style_reward_normalizer: Option<RunningMeanStd>,
    optimizer: nn::Optimizer,
    adaptation_optimizer: nn::Optimizer,
    discriminator_optimizer: nn::Optimizer,
    storage: Option<RolloutStorage>,
    transition: Transition,
    motion_window: Option<Tensor>,
    learning_rate: f64,
    total_updates: usize,
    device: Device,
}

/// Apply the state normalizer to every horizon step of `[B, H, D]` windows
fn normalize_windows(normalizer: Option<&RunningMeanStd>, windows: &Tensor) -> Tensor {
    match normalizer {
        Some(normalizer) => tch::no_grad(|| normalizer.normalize(windows)),
        None => windows.shallow_clone(),
    }
}

impl<A, D, E> LipsTrainer<A, D, E>
where
    A: ActorCritic,
    D: Discriminator,
    E: MotionSource,
{
    /// Create a new LIPS trainer
    ///
    /// The policy optimizer steps every actor-critic parameter, including
    /// the adaptation module the actor reads from. The adaptation optimizer
    /// is bound to the same store with a zero learning rate outside the
    /// adaptation group. Fails when the expert windows do not match the
    /// discriminator's window shape.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated hyperparameters
    /// * `actor_critic` - Policy with adaptation module
    /// * `discriminator` - Style discriminator
    /// * `expert_data` - Reference motion windows
    /// * `device` - Device for the replay buffer and rollout storage
    pub fn new(
        config: LipsConfig,
        actor_critic: A,
        discriminator: D,
        expert_data: E,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;

        let (horizon, obs_dim) =
            (discriminator.observation_horizon(), discriminator.observation_dim());
        if expert_data.observation_horizon() != horizon || expert_data.observation_dim() != obs_dim {
            bail!(
                "Expert windows are [{}, {}] but the discriminator scores [{}, {}]",
                expert_data.observation_horizon(),
                expert_data.observation_dim(),
                horizon,
                obs_dim
            );
        }

        let optimizer = nn::Adam::default()
            .build(actor_critic.var_store(), config.learning_rate)
            .context("Failed to build policy optimizer")?;
        let mut adaptation_optimizer = nn::Adam::default()
            .build(actor_critic.var_store(), 0.0)
            .context("Failed to build adaptation module optimizer")?;
        adaptation_optimizer.set_lr_group(
            actor_critic.adaptation_group(),
            config.adaptation_module_learning_rate,
        );

        let disc = &config.discriminator;
        let discriminator_optimizer = match disc.loss {
            DiscriminatorLoss::Wasserstein => nn::RmsProp {
                alpha: 0.99,
                eps: 1e-8,
                wd: disc.weight_decay,
                momentum: disc.momentum,
                centered: false,
            }
            .build(discriminator.var_store(), disc.learning_rate),
            DiscriminatorLoss::BceWithLogits | DiscriminatorLoss::SquaredError => nn::Sgd {
                momentum: disc.momentum,
                dampening: 0.0,
                wd: disc.weight_decay,
                nesterov: false,
            }
            .build(discriminator.var_store(), disc.learning_rate),
        }
        .context("Failed to build discriminator optimizer")?;

        let policy_data = ReplayBuffer::new(
            discriminator.observation_dim(),
            discriminator.observation_horizon(),
            disc.replay_buffer_size,
            device,
        );

        tracing::info!(
            "LIPS trainer: lr={}, adaptation_lr={}, discriminator={} (lr={}), replay capacity={}",
            config.learning_rate,
            config.adaptation_module_learning_rate,
            disc.loss,
            disc.learning_rate,
            disc.replay_buffer_size
        );

        Ok(Self {
            learning_rate: config.learning_rate,
            config,
            actor_critic,
            discriminator,
            expert_data,
            policy_data,
            state_normalizer: None,
            style_reward_normalizer: None,
            optimizer,
            adaptation_optimizer,
            discriminator_optimizer,
            storage: None,
            transition: Transition::new(),
            motion_window: None,
            total_updates: 0,
            device,
        })
    }

    /// Normalize discriminator inputs with a running state normalizer
    ///
    /// The normalizer size must equal the discriminator's per-step
    /// feature size.
    pub fn with_state_normalizer(mut self, normalizer: RunningMeanStd) -> Result<Self> {
        let obs_dim = self.discriminator.observation_dim();
        if normalizer.size() != obs_dim {
            bail!(
                "State normalizer has size {}, expected the motion feature size {}",
                normalizer.size(),
                obs_dim
            );
        }
        self.state_normalizer = Some(normalizer);
        Ok(self)
    }

    /// Normalize Wasserstein style rewards with a running normalizer
    ///
    /// The normalizer must have size 1.
    pub fn with_style_reward_normalizer(mut self, normalizer: RunningMeanStd) -> Result<Self> {
        if normalizer.size() != 1 {
            bail!("Style-reward normalizer must have size 1, got {}", normalizer.size());
        }
        self.style_reward_normalizer = Some(normalizer);
        Ok(self)
    }

    /// Allocate rollout storage
    ///
    /// Must be called before collection starts.
    pub fn init_storage(
        &mut self,
        num_envs: usize,
        num_transitions_per_env: usize,
        obs_shape: &[i64],
        privileged_obs_shape: &[i64],
        obs_history_shape: &[i64],
        action_shape: &[i64],
    ) {
        self.storage = Some(RolloutStorage::new(
            num_envs,
            num_transitions_per_env,
            obs_shape,
            privileged_obs_shape,
            obs_history_shape,
            action_shape,
            self.device,
        ));
    }

    /// Switch networks to evaluation behaviour
    pub fn test_mode(&mut self) {
        self.actor_critic.set_train(false);
        self.discriminator.set_train(false);
    }

    /// Switch networks to training behaviour
    pub fn train_mode(&mut self) {
        self.actor_critic.set_train(true);
        self.discriminator.set_train(true);
    }

    /// Sample actions and record the policy side of the current transition
    ///
    /// # Arguments
    ///
    /// * `obs` - Actor observations [N, obs...]
    /// * `privileged_obs` - Privileged observations [N, privileged...]
    /// * `obs_history` - Observation histories [N, history...]
    /// * `motion_window` - Current motion window [N, horizon, obs_dim]
    ///
    /// # Returns
    /// Sampled actions [N, action...]
    pub fn act(
        &mut self,
        obs: &Tensor,
        privileged_obs: &Tensor,
        obs_history: &Tensor,
        motion_window: &Tensor,
    ) -> Result<Tensor> {
        check_window_shape(
            motion_window,
            self.discriminator.observation_horizon(),
            self.discriminator.observation_dim(),
        )?;

        let actor_critic = &mut self.actor_critic;
        let (actions, values) = tch::no_grad(|| {
            let actions = actor_critic.act(obs_history, None);
            let values = actor_critic.evaluate(obs_history, privileged_obs, None);
            (actions, values)
        });
        let actions_log_prob = tch::no_grad(|| actor_critic.get_actions_log_prob(&actions))?;

        self.transition.actions = Some(actions.shallow_clone());
        self.transition.values = Some(values);
        self.transition.actions_log_prob = Some(actions_log_prob);
        self.transition.action_mean = Some(actor_critic.action_mean()?.detach());
        self.transition.action_sigma = Some(actor_critic.action_std()?.detach());
        self.transition.observations = Some(obs.shallow_clone());
        self.transition.critic_observations = Some(obs.shallow_clone());
        self.transition.privileged_observations = Some(privileged_obs.shallow_clone());
        self.transition.observation_histories = Some(obs_history.shallow_clone());
        self.motion_window = Some(motion_window.copy());

        Ok(actions)
    }

    /// Record the environment side of the current transition and store it
    ///
    /// Applies time-out bootstrapping, pushes the transition into rollout
    /// storage, and inserts the motion window advanced by `motion_obs`
    /// into the policy replay buffer.
    ///
    /// # Arguments
    ///
    /// * `rewards` - Rewards [N]
    /// * `dones` - Episode-end flags [N]
    /// * `infos` - Optional env bins and time-out flags
    /// * `motion_obs` - Newest motion observation [N, obs_dim]
    pub fn process_env_step(
        &mut self,
        rewards: &Tensor,
        dones: &Tensor,
        infos: &StepInfos,
        motion_obs: &Tensor,
    ) -> Result<()> {
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| anyhow!("Storage not initialized. Call init_storage() first."))?;
        let window = self
            .motion_window
            .take()
            .ok_or_else(|| anyhow!("No motion window recorded. Call act() first."))?;

        let mut rewards = rewards.to_kind(Kind::Float).to_device(self.device).reshape([-1]);
        if let Some(time_outs) = &infos.time_outs {
            let values = self
                .transition
                .values
                .as_ref()
                .ok_or_else(|| anyhow!("No values recorded. Call act() first."))?;
            let time_outs = time_outs.to_kind(Kind::Float).to_device(self.device).reshape([-1]);
            rewards = rewards + values.reshape([-1]) * time_outs * self.config.gamma;
        }

        self.transition.rewards = Some(rewards);
        self.transition.dones = Some(dones.to_kind(Kind::Float));
        self.transition.env_bins = infos.env_bins.as_ref().map(|bins| bins.to_kind(Kind::Float));
        storage.add_transitions(&self.transition)?;

        let horizon = window.size()[1];
        let next_window = Tensor::cat(
            &[window.narrow(1, 1, horizon - 1), motion_obs.to_kind(window.kind()).unsqueeze(1)],
            1,
        );
        self.policy_data.insert(&next_window)?;

        self.transition.clear();
        self.actor_critic.reset(dones);
        Ok(())
    }

    /// Bootstrap from the final state and compute GAE returns
    pub fn compute_returns(&mut self, last_obs_history: &Tensor, last_privileged_obs: &Tensor) -> Result<()> {
        let storage = self
            .storage
            .as_mut()
            .ok_or_else(|| anyhow!("Storage not initialized. Call init_storage() first."))?;

        let actor_critic = &self.actor_critic;
        let last_values =
            tch::no_grad(|| actor_critic.evaluate(last_obs_history, last_privileged_obs, None));
        storage.compute_returns(&last_values, self.config.gamma, self.config.lam)
    }

    /// Run one full update: policy/value with adaptation module, then
    /// discriminator
    ///
    /// Rollout storage is cleared only when every phase succeeds.
    pub fn update(&mut self) -> Result<UpdateStats> {
        let mut storage = self
            .storage
            .take()
            .ok_or_else(|| anyhow!("Storage not initialized. Call init_storage() first."))?;

        let result = self.update_from(&storage);
        if result.is_ok() {
            storage.clear();
        }
        self.storage = Some(storage);

        let stats = result?;
        self.total_updates += 1;
        tracing::info!(
            "Update {}: value_loss={:.4}, surrogate={:.4}, adaptation={:.4} (test {:.4}), disc={:.4}, grad_pen={:.4}, pred policy/expert={:.3}/{:.3}, lr={:.2e}, kl={:.4}",
            self.total_updates,
            stats.value_loss,
            stats.surrogate_loss,
            stats.adaptation_loss,
            stats.adaptation_test_loss,
            stats.discriminator_loss,
            stats.grad_pen_loss,
            stats.policy_pred,
            stats.expert_pred,
            stats.learning_rate,
            stats.mean_kl
        );
        Ok(stats)
    }

    fn update_from(&mut self, storage: &RolloutStorage) -> Result<UpdateStats> {
        if let Some(dims) = &self.config.selective_adaptation_dims {
            let privileged_dim = *storage.privileged_observations().size().last().unwrap_or(&1);
            if let Some(dim) = dims.iter().find(|&&d| d >= privileged_dim) {
                bail!(
                    "Selective adaptation dim {} is out of range for {} privileged features",
                    dim,
                    privileged_dim
                );
            }
        }

        let mut stats = UpdateStats::zeros();

        let (num_mini_batches, num_epochs) =
            (self.config.num_mini_batches, self.config.num_learning_epochs);
        let generator: Box<dyn Iterator<Item = Minibatch> + '_> =
            if self.actor_critic.is_recurrent() {
                Box::new(storage.recurrent_mini_batch_generator(num_mini_batches, num_epochs)?)
            } else {
                Box::new(storage.mini_batch_generator(num_mini_batches, num_epochs)?)
            };

        for batch in generator {
            self.policy_step(&batch, &mut stats)?;
            self.adaptation_steps(&batch, &mut stats)?;
        }

        let batch_size = storage.len() / self.config.discriminator.num_mini_batches;
        self.discriminator_steps(batch_size, &mut stats)?;

        stats.learning_rate = self.learning_rate;
        Ok(stats.average())
    }

    fn policy_step(&mut self, batch: &Minibatch, stats: &mut UpdateStats) -> Result<()> {
        let masks = batch.masks.as_ref();
        self.actor_critic.act(&batch.observation_histories, masks);
        let actions_log_prob = self.actor_critic.get_actions_log_prob(&batch.actions)?;
        let values = self
            .actor_critic
            .evaluate(&batch.observation_histories, &batch.privileged_observations, masks);
        let mu = self.actor_critic.action_mean()?;
        let sigma = self.actor_critic.action_std()?;
        let entropy = self.actor_critic.entropy()?;

        let mut kl_mean = 0.0;
        if let (Schedule::Adaptive, Some(desired_kl)) = (self.config.schedule, self.config.desired_kl) {
            let kl = tch::no_grad(|| {
                DiagGaussian::kl(&batch.old_mu, &batch.old_sigma, &mu, &sigma).mean(Kind::Float)
            });
            kl_mean = f64::try_from(&kl)?;

            let learning_rate = adapt_learning_rate(self.learning_rate, kl_mean, desired_kl);
            if learning_rate != self.learning_rate {
                tracing::debug!(
                    "KL {:.5} vs target {}: learning rate {:.2e} -> {:.2e}",
                    kl_mean,
                    desired_kl,
                    self.learning_rate,
                    learning_rate
                );
            }
            self.learning_rate = learning_rate;
            self.optimizer.set_lr(learning_rate);
        }

        let surrogate_loss = compute_surrogate_loss(
            &actions_log_prob,
            &batch.old_actions_log_prob,
            &batch.advantages,
            self.config.clip_param,
        );
        let value_clip = self.config.use_clipped_value_loss.then_some(self.config.clip_param);
        let value_loss = compute_value_loss(&values, &batch.target_values, &batch.returns, value_clip);

        let loss = &surrogate_loss + &value_loss * self.config.value_loss_coef
            - entropy.mean(Kind::Float) * self.config.entropy_coef;

        self.optimizer.zero_grad();
        loss.backward();
        self.optimizer.clip_grad_norm(self.config.max_grad_norm);
        self.optimizer.step();

        stats.add_policy_step(f64::try_from(&value_loss)?, f64::try_from(&surrogate_loss)?, kl_mean);
        Ok(())
    }

    fn adaptation_steps(&mut self, batch: &Minibatch, stats: &mut UpdateStats) -> Result<()> {
        let target = batch.privileged_observations.detach();
        let privileged_dim = *target.size().last().unwrap_or(&1);
        let target = target.reshape([-1, privileged_dim]);
        let num_train = target.size()[0] / 5 * 4;
        let dims = self.config.selective_adaptation_dims.as_deref();

        for _ in 0..self.config.num_adaptation_module_substeps {
            let prediction = self
                .actor_critic
                .adaptation_module(&batch.observation_histories)
                .reshape([-1, privileged_dim]);
            let (train_loss, test_loss) = compute_adaptation_loss(&prediction, &target, num_train, dims);

            if num_train > 0 {
                self.adaptation_optimizer.zero_grad();
                train_loss.backward();
                self.adaptation_optimizer.step();
            }

            stats.add_adaptation_step(f64::try_from(&train_loss)?, f64::try_from(&test_loss)?);
        }
        Ok(())
    }

    fn discriminator_steps(&mut self, batch_size: usize, stats: &mut UpdateStats) -> Result<()> {
        let num_mini_batches = self.config.discriminator.num_mini_batches;
        let loss_kind = self.config.discriminator.loss;
        let lambda = self.config.discriminator.gradient_penalty_coef;

        let policy_generator = self
            .policy_data
            .feed_forward_generator(num_mini_batches, batch_size)
            .context("Failed to sample policy motion windows")?;
        let expert_generator = self
            .expert_data
            .feed_forward_generator(num_mini_batches, batch_size)
            .context("Failed to sample expert motion windows")?;

        for (policy_batch, expert_batch) in policy_generator.zip(expert_generator) {
            let policy_input = normalize_windows(self.state_normalizer.as_ref(), &policy_batch);
            let expert_input = normalize_windows(self.state_normalizer.as_ref(), &expert_batch);

            let policy_d = self.discriminator.forward(&policy_input.flatten(1, 2));
            let expert_d = self.discriminator.forward(&expert_input.flatten(1, 2));

            let (expert_loss, policy_loss) = loss_kind.compute(&expert_d, &policy_d);
            let style_loss = (expert_loss + policy_loss) * 0.5;
            let grad_pen_loss = self.discriminator.compute_grad_pen(&expert_batch, lambda);

            let loss = &style_loss + &grad_pen_loss;
            self.discriminator_optimizer.zero_grad();
            loss.backward();
            self.discriminator_optimizer.step();

            if let Some(normalizer) = self.state_normalizer.as_mut() {
                normalizer.update(&policy_batch.select(1, 0))?;
                normalizer.update(&expert_batch.select(1, 0))?;
            }

            stats.add_discriminator_step(
                f64::try_from(&style_loss)?,
                f64::try_from(&grad_pen_loss)?,
                f64::try_from(&policy_d.mean(Kind::Float))?,
                f64::try_from(&expert_d.mean(Kind::Float))?,
            );
        }
        Ok(())
    }

    /// Style reward for a batch of motion windows
    ///
    /// # Arguments
    ///
    /// * `motion_window` - Motion windows [N, horizon, obs_dim]
    ///
    /// # Returns
    /// (reward [N], raw discriminator score [N])
    pub fn style_reward(&mut self, motion_window: &Tensor) -> Result<(Tensor, Tensor)> {
        check_window_shape(
            motion_window,
            self.discriminator.observation_horizon(),
            self.discriminator.observation_dim(),
        )?;

        let loss_kind = self.config.discriminator.loss;
        let input = normalize_windows(self.state_normalizer.as_ref(), motion_window);
        let discriminator = &self.discriminator;
        let d = tch::no_grad(|| discriminator.forward(&input.flatten(1, 2)).reshape([-1]));

        let reward = match (loss_kind, self.style_reward_normalizer.as_mut()) {
            (DiscriminatorLoss::Wasserstein, Some(normalizer)) => {
                let reward = tch::no_grad(|| normalizer.normalize(&d));
                normalizer.update(&d.unsqueeze(-1))?;
                reward
            }
            (kind, _) => tch::no_grad(|| kind.style_reward(&d)),
        };
        Ok((reward, d))
    }

    /// Get the configuration
    pub fn config(&self) -> &LipsConfig {
        &self.config
    }

    /// Get reference to the actor-critic
    pub fn actor_critic(&self) -> &A {
        &self.actor_critic
    }

    /// Get mutable reference to the actor-critic
    pub fn actor_critic_mut(&mut self) -> &mut A {
        &mut self.actor_critic
    }

    /// Get reference to the discriminator
    pub fn discriminator(&self) -> &D {
        &self.discriminator
    }

    /// Get reference to the expert motion source
    pub fn expert_data(&self) -> &E {
        &self.expert_data
    }

    /// Get the policy motion replay buffer
    pub fn policy_data(&self) -> &ReplayBuffer {
        &self.policy_data
    }

    /// Get the rollout storage, if initialized
    pub fn storage(&self) -> Option<&RolloutStorage> {
        self.storage.as_ref()
    }

    /// Get the state normalizer, if any
    pub fn state_normalizer(&self) -> Option<&RunningMeanStd> {
        self.state_normalizer.as_ref()
    }

    /// Get the style-reward normalizer, if any
    pub fn style_reward_normalizer(&self) -> Option<&RunningMeanStd> {
        self.style_reward_normalizer.as_ref()
    }

    /// Current policy learning rate
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Adaptation module learning rate
    pub fn adaptation_learning_rate(&self) -> f64 {
        self.config.adaptation_module_learning_rate
    }

    /// Number of completed updates
    pub fn total_updates(&self) -> usize {
        self.total_updates
    }

    /// Device of the rollout storage and replay buffer
    pub fn device(&self) -> Device {
        self.device
    }
}
