//! Minibatch generation for rollout storage
//!
//! Two generators drain a full [`RolloutStorage`]:
//!
//! - [`MinibatchGenerator`] flattens time and environment axes and deals
//!   out a fresh random partition each epoch.
//! - [`RecurrentMinibatchGenerator`] keeps time contiguity by slicing
//!   along the environment axis, with observations split at episode
//!   boundaries and padded into fixed-length trajectories.

use anyhow::{Result, bail};
use rand::{seq::SliceRandom, thread_rng};
use tch::{Device, Kind, Tensor};

use super::storage::RolloutStorage;

/// One minibatch of rollout data
///
/// Feed-forward batches are flat `[B, ...]`. Recurrent batches keep time
/// first: observation fields are padded trajectories `[T, K, ...]` with
/// `masks` marking valid steps, the rest are `[T, envs_in_batch, ...]`.
#[derive(Debug)]
pub struct Minibatch {
    pub observations: Tensor,
    pub critic_observations: Tensor,
    pub privileged_observations: Tensor,
    pub observation_histories: Tensor,
    pub actions: Tensor,
    /// Value estimates recorded during collection
    pub target_values: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
    pub old_actions_log_prob: Tensor,
    pub old_mu: Tensor,
    pub old_sigma: Tensor,
    /// Valid-step masks `[T, K]`; only set for recurrent batches
    pub masks: Option<Tensor>,
    pub env_bins: Tensor,
}

impl Minibatch {
    /// Number of samples (or environments for recurrent batches)
    pub fn size(&self) -> i64 {
        if self.masks.is_some() { self.actions.size()[1] } else { self.actions.size()[0] }
    }
}

/// Storage tensors with the `[T, N]` axes merged
struct FlatRollout {
    observations: Tensor,
    critic_observations: Tensor,
    privileged_observations: Tensor,
    observation_histories: Tensor,
    actions: Tensor,
    values: Tensor,
    advantages: Tensor,
    returns: Tensor,
    actions_log_prob: Tensor,
    mu: Tensor,
    sigma: Tensor,
    env_bins: Tensor,
}

impl FlatRollout {
    fn new(storage: &RolloutStorage) -> Self {
        let flat = |t: &Tensor| t.flatten(0, 1);
        Self {
            observations: flat(storage.observations()),
            critic_observations: flat(storage.critic_observations()),
            privileged_observations: flat(storage.privileged_observations()),
            observation_histories: flat(storage.observation_histories()),
            actions: flat(storage.actions()),
            values: flat(storage.values()),
            advantages: flat(storage.advantages()),
            returns: flat(storage.returns()),
            actions_log_prob: flat(storage.actions_log_prob()),
            mu: flat(storage.mu()),
            sigma: flat(storage.sigma()),
            env_bins: flat(storage.env_bins()),
        }
    }

    fn select(&self, indices: &Tensor) -> Minibatch {
        let pick = |t: &Tensor| t.index_select(0, indices);
        Minibatch {
            observations: pick(&self.observations),
            critic_observations: pick(&self.critic_observations),
            privileged_observations: pick(&self.privileged_observations),
            observation_histories: pick(&self.observation_histories),
            actions: pick(&self.actions),
            target_values: pick(&self.values),
            advantages: pick(&self.advantages),
            returns: pick(&self.returns),
            old_actions_log_prob: pick(&self.actions_log_prob),
            old_mu: pick(&self.mu),
            old_sigma: pick(&self.sigma),
            masks: None,
            env_bins: pick(&self.env_bins),
        }
    }
}

fn check_partition(num_mini_batches: usize, total: usize, what: &str) -> Result<usize> {
    if num_mini_batches == 0 {
        bail!("num_mini_batches must be > 0");
    }
    if num_mini_batches > total {
        bail!("Cannot split {} {} into {} minibatches", total, what, num_mini_batches);
    }
    Ok(total / num_mini_batches)
}

/// Shuffled feed-forward minibatch iterator
///
/// Yields `num_epochs * num_mini_batches` batches of size
/// `len / num_mini_batches`. Within an epoch the batches are disjoint;
/// a remainder of `len % num_mini_batches` samples is left out.
pub struct MinibatchGenerator<'a> {
    storage: &'a RolloutStorage,
    flat: FlatRollout,
    num_mini_batches: usize,
    num_epochs: usize,
    mini_batch_size: usize,
    permutation: Vec<i64>,
    epoch: usize,
    batch: usize,
}

impl<'a> MinibatchGenerator<'a> {
    pub(super) fn new(
        storage: &'a RolloutStorage,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> Result<Self> {
        let mini_batch_size = check_partition(num_mini_batches, storage.len(), "samples")?;
        Ok(Self {
            storage,
            flat: FlatRollout::new(storage),
            num_mini_batches,
            num_epochs,
            mini_batch_size,
            permutation: Vec::new(),
            epoch: 0,
            batch: 0,
        })
    }

    /// Samples per minibatch
    pub fn mini_batch_size(&self) -> usize {
        self.mini_batch_size
    }

    /// Total batches this generator yields
    pub fn num_batches(&self) -> usize {
        self.num_epochs * self.num_mini_batches
    }

    fn reshuffle(&mut self) {
        self.permutation = (0..self.storage.len() as i64).collect();
        self.permutation.shuffle(&mut thread_rng());
    }
}

impl Iterator for MinibatchGenerator<'_> {
    type Item = Minibatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.epoch >= self.num_epochs {
            return None;
        }
        if self.batch == 0 {
            self.reshuffle();
        }

        let start = self.batch * self.mini_batch_size;
        let end = start + self.mini_batch_size;
        let indices =
            Tensor::from_slice(&self.permutation[start..end]).to_device(self.storage.device());
        let minibatch = self.flat.select(&indices);

        self.batch += 1;
        if self.batch == self.num_mini_batches {
            self.batch = 0;
            self.epoch += 1;
        }
        Some(minibatch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let done = self.epoch * self.num_mini_batches + self.batch;
        let remaining = self.num_batches().saturating_sub(done);
        (remaining, Some(remaining))
    }
}

/// Split `[T, N, ...]` data at episode boundaries and pad to length `T`
///
/// A done flag at step `t` ends a trajectory after `t`. The final step
/// always closes a trajectory. Trajectories are ordered environment-major.
///
/// # Returns
///
/// `(padded, masks, trajectories_per_env)` where `padded` is `[T, K, ...]`,
/// `masks` is a boolean `[T, K]` marking real steps, and
/// `trajectories_per_env[e]` counts the trajectories cut from env `e`.
pub fn split_and_pad_trajectories(
    tensor: &Tensor,
    dones: &Tensor,
) -> Result<(Tensor, Tensor, Vec<usize>)> {
    let size = tensor.size();
    if size.len() < 2 {
        bail!("Expected [T, N, ...] data, got shape {:?}", size);
    }
    let (num_steps, num_envs) = (size[0], size[1]);
    if dones.numel() as i64 != num_steps * num_envs {
        bail!(
            "Done flags have {} elements, expected {} for shape {:?}",
            dones.numel(),
            num_steps * num_envs,
            size
        );
    }

    // Env-major flags so each environment's timeline is contiguous
    let flags = dones
        .to_kind(Kind::Float)
        .to_device(Device::Cpu)
        .reshape([num_steps, num_envs])
        .transpose(0, 1)
        .reshape([-1]);
    let flags: Vec<f32> = Vec::try_from(&flags)?;

    let mut segments = Vec::new();
    let mut trajectories_per_env = vec![0usize; num_envs as usize];
    for env in 0..num_envs {
        let mut start = 0;
        for step in 0..num_steps {
            let done = flags[(env * num_steps + step) as usize] != 0.0;
            if done || step == num_steps - 1 {
                segments.push((env, start, step + 1 - start));
                trajectories_per_env[env as usize] += 1;
                start = step + 1;
            }
        }
    }

    let num_trajectories = segments.len() as i64;
    let mut padded_size = vec![num_steps, num_trajectories];
    padded_size.extend_from_slice(&size[2..]);
    let padded = Tensor::zeros(padded_size, (tensor.kind(), tensor.device()));
    let mut mask_values = vec![0f32; (num_steps * num_trajectories) as usize];

    tch::no_grad(|| {
        for (k, &(env, start, len)) in segments.iter().enumerate() {
            let src = tensor.select(1, env).narrow(0, start, len);
            padded.select(1, k as i64).narrow(0, 0, len).copy_(&src);
            for step in 0..len {
                mask_values[(step * num_trajectories) as usize + k] = 1.0;
            }
        }
    });

    let masks = Tensor::from_slice(&mask_values)
        .reshape([num_steps, num_trajectories])
        .to_kind(Kind::Bool)
        .to_device(tensor.device());

    Ok((padded, masks, trajectories_per_env))
}

/// Inverse of [`split_and_pad_trajectories`]: rebuild `[T, N, ...]` data
pub fn unpad_trajectories(padded: &Tensor, masks: &Tensor) -> Tensor {
    let size = padded.size();
    let num_steps = size[0];
    let mut out_size = vec![-1, num_steps];
    out_size.extend_from_slice(&size[2..]);

    let masks = masks.transpose(0, 1);
    padded
        .transpose(0, 1)
        .index(&[Some(masks)])
        .reshape(out_size)
        .transpose(0, 1)
}

/// Time-contiguous minibatch iterator for recurrent policies
///
/// Partitions the environment axis into `num_mini_batches` slices of
/// `num_envs / num_mini_batches` environments. Each batch carries the
/// padded trajectories belonging to its environments.
pub struct RecurrentMinibatchGenerator<'a> {
    storage: &'a RolloutStorage,
    padded_observations: Tensor,
    padded_critic_observations: Tensor,
    padded_privileged_observations: Tensor,
    padded_observation_histories: Tensor,
    masks: Tensor,
    trajectory_offsets: Vec<usize>,
    num_mini_batches: usize,
    num_epochs: usize,
    mini_batch_size: usize,
    epoch: usize,
    batch: usize,
}

impl<'a> RecurrentMinibatchGenerator<'a> {
    pub(super) fn new(
        storage: &'a RolloutStorage,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> Result<Self> {
        let mini_batch_size = check_partition(num_mini_batches, storage.num_envs(), "environments")?;
        let dones = storage.dones();

        let (padded_observations, masks, trajectories_per_env) =
            split_and_pad_trajectories(storage.observations(), dones)?;
        let (padded_critic_observations, _, _) =
            split_and_pad_trajectories(storage.critic_observations(), dones)?;
        let (padded_privileged_observations, _, _) =
            split_and_pad_trajectories(storage.privileged_observations(), dones)?;
        let (padded_observation_histories, _, _) =
            split_and_pad_trajectories(storage.observation_histories(), dones)?;

        let mut trajectory_offsets = Vec::with_capacity(trajectories_per_env.len() + 1);
        trajectory_offsets.push(0);
        for count in &trajectories_per_env {
            let last = trajectory_offsets[trajectory_offsets.len() - 1];
            trajectory_offsets.push(last + count);
        }

        Ok(Self {
            storage,
            padded_observations,
            padded_critic_observations,
            padded_privileged_observations,
            padded_observation_histories,
            masks,
            trajectory_offsets,
            num_mini_batches,
            num_epochs,
            mini_batch_size,
            epoch: 0,
            batch: 0,
        })
    }

    /// Environments per minibatch
    pub fn mini_batch_size(&self) -> usize {
        self.mini_batch_size
    }

    /// Total batches this generator yields
    pub fn num_batches(&self) -> usize {
        self.num_epochs * self.num_mini_batches
    }
}

impl Iterator for RecurrentMinibatchGenerator<'_> {
    type Item = Minibatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.epoch >= self.num_epochs {
            return None;
        }

        let start = self.batch * self.mini_batch_size;
        let stop = start + self.mini_batch_size;
        let first_traj = self.trajectory_offsets[start] as i64;
        let num_traj = self.trajectory_offsets[stop] as i64 - first_traj;

        let trajectories = |t: &Tensor| t.narrow(1, first_traj, num_traj);
        let envs = |t: &Tensor| t.narrow(1, start as i64, self.mini_batch_size as i64);

        let storage = self.storage;
        let minibatch = Minibatch {
            observations: trajectories(&self.padded_observations),
            critic_observations: trajectories(&self.padded_critic_observations),
            privileged_observations: trajectories(&self.padded_privileged_observations),
            observation_histories: trajectories(&self.padded_observation_histories),
            actions: envs(storage.actions()),
            target_values: envs(storage.values()),
            advantages: envs(storage.advantages()),
            returns: envs(storage.returns()),
            old_actions_log_prob: envs(storage.actions_log_prob()),
            old_mu: envs(storage.mu()),
            old_sigma: envs(storage.sigma()),
            masks: Some(trajectories(&self.masks)),
            env_bins: envs(storage.env_bins()),
        };

        self.batch += 1;
        if self.batch == self.num_mini_batches {
            self.batch = 0;
            self.epoch += 1;
        }
        Some(minibatch)
    }
}
