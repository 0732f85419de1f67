//! Rollout storage and per-step transition records

use anyhow::{Context, Result, anyhow, bail};
use tch::{Device, Kind, Tensor};

use super::{
    gae::{compute_gae, normalize_advantages},
    sampling::{MinibatchGenerator, RecurrentMinibatchGenerator},
};

/// One timestep of data for all environments
///
/// Filled piecewise during collection: the policy side by the trainer's
/// `act`, the environment side by `process_env_step`. Cleared after it is
/// copied into [`RolloutStorage`].
#[derive(Debug, Default)]
pub struct Transition {
    /// Actor observations [num_envs, obs...]
    pub observations: Option<Tensor>,

    /// Critic observations [num_envs, obs...]
    pub critic_observations: Option<Tensor>,

    /// Privileged observations [num_envs, privileged...]
    pub privileged_observations: Option<Tensor>,

    /// Observation histories [num_envs, history...]
    pub observation_histories: Option<Tensor>,

    /// Actions taken [num_envs, action...]
    pub actions: Option<Tensor>,

    /// Rewards received [num_envs]
    pub rewards: Option<Tensor>,

    /// Episode-end flags [num_envs]
    pub dones: Option<Tensor>,

    /// Value estimates [num_envs, 1]
    pub values: Option<Tensor>,

    /// Log probabilities of the actions [num_envs]
    pub actions_log_prob: Option<Tensor>,

    /// Action distribution mean [num_envs, action...]
    pub action_mean: Option<Tensor>,

    /// Action distribution std [num_envs, action...]
    pub action_sigma: Option<Tensor>,

    /// Environment-bin labels [num_envs]; zero when absent
    pub env_bins: Option<Tensor>,
}

impl Transition {
    /// Create an empty transition
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every field to empty
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Fixed-capacity on-policy rollout storage
///
/// Holds exactly `num_transitions_per_env` time slots for `num_envs`
/// parallel environments. Advantages and returns are computed once the
/// storage is full, after which minibatch generators can drain it.
#[derive(Debug)]
pub struct RolloutStorage {
    num_envs: usize,
    num_transitions_per_env: usize,

    observations: Tensor,
    critic_observations: Tensor,
    privileged_observations: Tensor,
    observation_histories: Tensor,
    actions: Tensor,
    rewards: Tensor,
    dones: Tensor,
    values: Tensor,
    actions_log_prob: Tensor,
    mu: Tensor,
    sigma: Tensor,
    env_bins: Tensor,

    returns: Tensor,
    advantages: Tensor,

    step: usize,
    returns_computed: bool,
    device: Device,
}

fn alloc(num_steps: usize, num_envs: usize, shape: &[i64], device: Device) -> Tensor {
    let mut size = vec![num_steps as i64, num_envs as i64];
    size.extend_from_slice(shape);
    Tensor::zeros(size, (Kind::Float, device))
}

fn write_slot(dst: &Tensor, step: i64, src: Option<&Tensor>, name: &str) -> Result<()> {
    let src = src.ok_or_else(|| anyhow!("Transition field `{}` is missing", name))?;
    let mut slot = dst.get(step);
    let src = src
        .detach()
        .to_kind(slot.kind())
        .to_device(slot.device())
        .f_reshape(slot.size())
        .with_context(|| {
            format!("Transition field `{}` has shape {:?}, expected {:?}", name, src.size(), slot.size())
        })?;
    slot.copy_(&src);
    Ok(())
}

impl RolloutStorage {
    /// Create a new rollout storage
    ///
    /// # Arguments
    ///
    /// * `num_envs` - Number of parallel environments
    /// * `num_transitions_per_env` - Time slots per rollout
    /// * `obs_shape` - Per-env actor observation shape
    /// * `privileged_obs_shape` - Per-env privileged observation shape
    /// * `obs_history_shape` - Per-env observation-history shape
    /// * `action_shape` - Per-env action shape
    /// * `device` - Device for all tensors
    pub fn new(
        num_envs: usize,
        num_transitions_per_env: usize,
        obs_shape: &[i64],
        privileged_obs_shape: &[i64],
        obs_history_shape: &[i64],
        action_shape: &[i64],
        device: Device,
    ) -> Self {
        let (t, n) = (num_transitions_per_env, num_envs);
        Self {
            num_envs,
            num_transitions_per_env,
            observations: alloc(t, n, obs_shape, device),
            critic_observations: alloc(t, n, obs_shape, device),
            privileged_observations: alloc(t, n, privileged_obs_shape, device),
            observation_histories: alloc(t, n, obs_history_shape, device),
            actions: alloc(t, n, action_shape, device),
            rewards: alloc(t, n, &[1], device),
            dones: alloc(t, n, &[1], device),
            values: alloc(t, n, &[1], device),
            actions_log_prob: alloc(t, n, &[1], device),
            mu: alloc(t, n, action_shape, device),
            sigma: alloc(t, n, action_shape, device),
            env_bins: alloc(t, n, &[1], device),
            returns: alloc(t, n, &[1], device),
            advantages: alloc(t, n, &[1], device),
            step: 0,
            returns_computed: false,
            device,
        }
    }

    /// Copy a transition into the next time slot
    ///
    /// Fails when the storage is already full or a required field is
    /// missing or mis-shaped.
    pub fn add_transitions(&mut self, transition: &Transition) -> Result<()> {
        if self.is_full() {
            bail!(
                "Rollout buffer overflow: all {} steps are already filled",
                self.num_transitions_per_env
            );
        }

        let step = self.step as i64;
        tch::no_grad(|| -> Result<()> {
            write_slot(&self.observations, step, transition.observations.as_ref(), "observations")?;
            write_slot(
                &self.critic_observations,
                step,
                transition.critic_observations.as_ref(),
                "critic_observations",
            )?;
            write_slot(
                &self.privileged_observations,
                step,
                transition.privileged_observations.as_ref(),
                "privileged_observations",
            )?;
            write_slot(
                &self.observation_histories,
                step,
                transition.observation_histories.as_ref(),
                "observation_histories",
            )?;
            write_slot(&self.actions, step, transition.actions.as_ref(), "actions")?;
            write_slot(&self.rewards, step, transition.rewards.as_ref(), "rewards")?;
            write_slot(&self.dones, step, transition.dones.as_ref(), "dones")?;
            write_slot(&self.values, step, transition.values.as_ref(), "values")?;
            write_slot(
                &self.actions_log_prob,
                step,
                transition.actions_log_prob.as_ref(),
                "actions_log_prob",
            )?;
            write_slot(&self.mu, step, transition.action_mean.as_ref(), "action_mean")?;
            write_slot(&self.sigma, step, transition.action_sigma.as_ref(), "action_sigma")?;
            match transition.env_bins.as_ref() {
                Some(bins) => write_slot(&self.env_bins, step, Some(bins), "env_bins")?,
                None => {
                    let _ = self.env_bins.get(step).zero_();
                }
            }
            Ok(())
        })?;

        self.step += 1;
        self.returns_computed = false;
        Ok(())
    }

    /// Compute returns and normalized advantages with GAE
    ///
    /// # Arguments
    ///
    /// * `last_values` - Bootstrap values for the state after the final
    ///   step, `[num_envs, 1]` or `[num_envs]`
    /// * `gamma` - Discount factor
    /// * `lam` - GAE lambda
    pub fn compute_returns(&mut self, last_values: &Tensor, gamma: f64, lam: f64) -> Result<()> {
        if !self.is_full() {
            bail!(
                "Rollout storage holds {} of {} steps; fill it before computing returns",
                self.step,
                self.num_transitions_per_env
            );
        }

        tch::no_grad(|| {
            let (advantages, returns) =
                compute_gae(&self.rewards, &self.values, &self.dones, last_values, gamma, lam);
            self.returns.copy_(&returns);
            self.advantages.copy_(&normalize_advantages(&advantages));
        });

        self.returns_computed = true;
        Ok(())
    }

    /// Shuffled feed-forward minibatches over all samples
    pub fn mini_batch_generator(
        &self,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> Result<MinibatchGenerator<'_>> {
        self.check_ready()?;
        MinibatchGenerator::new(self, num_mini_batches, num_epochs)
    }

    /// Environment-contiguous minibatches for recurrent policies
    pub fn recurrent_mini_batch_generator(
        &self,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> Result<RecurrentMinibatchGenerator<'_>> {
        self.check_ready()?;
        RecurrentMinibatchGenerator::new(self, num_mini_batches, num_epochs)
    }

    fn check_ready(&self) -> Result<()> {
        if !self.returns_computed {
            bail!("Must compute returns before generating minibatches");
        }
        Ok(())
    }

    /// Rewind the fill pointer; the allocation is kept
    pub fn clear(&mut self) {
        self.step = 0;
        self.returns_computed = false;
    }

    /// Number of filled samples (`filled_steps * num_envs`)
    pub fn len(&self) -> usize {
        self.step * self.num_envs
    }

    /// Check if no step has been added since the last clear
    pub fn is_empty(&self) -> bool {
        self.step == 0
    }

    /// Check if every time slot is filled
    pub fn is_full(&self) -> bool {
        self.step >= self.num_transitions_per_env
    }

    /// Number of filled time slots
    pub fn step(&self) -> usize {
        self.step
    }

    /// Total number of samples when full
    pub fn capacity(&self) -> usize {
        self.num_envs * self.num_transitions_per_env
    }

    /// Number of parallel environments
    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    /// Steps stored per environment when full
    pub fn num_transitions_per_env(&self) -> usize {
        self.num_transitions_per_env
    }

    /// Device the buffers live on
    pub fn device(&self) -> Device {
        self.device
    }

    // Getters for raw [T, N, ...] data access. Slots at or past `step()`
    // hold stale data from the previous rollout.

    /// Actor observations [T, N, obs...]
    pub fn observations(&self) -> &Tensor { &self.observations }
    /// Critic observations [T, N, obs...]
    pub fn critic_observations(&self) -> &Tensor { &self.critic_observations }
    /// Privileged observations [T, N, privileged...]
    pub fn privileged_observations(&self) -> &Tensor { &self.privileged_observations }
    /// Observation histories [T, N, history...]
    pub fn observation_histories(&self) -> &Tensor { &self.observation_histories }
    /// Sampled actions [T, N, action...]
    pub fn actions(&self) -> &Tensor { &self.actions }
    /// Rewards after time-out bootstrapping [T, N, 1]
    pub fn rewards(&self) -> &Tensor { &self.rewards }
    /// Episode-end flags [T, N, 1]
    pub fn dones(&self) -> &Tensor { &self.dones }
    /// Value estimates at collection time [T, N, 1]
    pub fn values(&self) -> &Tensor { &self.values }
    /// Log-probabilities of the sampled actions [T, N, 1]
    pub fn actions_log_prob(&self) -> &Tensor { &self.actions_log_prob }
    /// Action means at collection time [T, N, action...]
    pub fn mu(&self) -> &Tensor { &self.mu }
    /// Action standard deviations at collection time [T, N, action...]
    pub fn sigma(&self) -> &Tensor { &self.sigma }
    /// Environment-bin labels [T, N, 1]
    pub fn env_bins(&self) -> &Tensor { &self.env_bins }
    /// GAE returns [T, N, 1]
    pub fn returns(&self) -> &Tensor { &self.returns }
    /// Normalized advantages [T, N, 1]
    pub fn advantages(&self) -> &Tensor { &self.advantages }
}
