//! Motion-window buffers feeding the style discriminator
//!
//! Two sources share one sampling contract ([`MotionSource`]):
//! - [`ReplayBuffer`]: ring buffer of windows produced by the live policy
//!   (the discriminator's "fake" samples)
//! - [`ExpertMotionData`]: fixed set of reference windows
//!
//! A window is a `[horizon, obs_dim]` slice of consecutive observations.

use anyhow::{Context, Result, bail};
use rand::Rng;
use tch::{Device, Kind, Tensor};

/// Anything that can hand out random minibatches of motion windows
pub trait MotionSource {
    /// Draw `num_mini_batches` batches of `mini_batch_size` windows each
    ///
    /// Samples are i.i.d. uniform with replacement. Fails when the source
    /// holds no windows.
    fn feed_forward_generator(
        &self,
        num_mini_batches: usize,
        mini_batch_size: usize,
    ) -> Result<MotionBatches>;

    /// Per-step feature size
    fn observation_dim(&self) -> i64;

    /// Steps per window
    fn observation_horizon(&self) -> i64;
}

/// Finite iterator over sampled `[mini_batch_size, horizon, obs_dim]` batches
pub struct MotionBatches {
    windows: Tensor,
    indices: Vec<i64>,
    mini_batch_size: usize,
    current_batch: usize,
}

impl MotionBatches {
    fn sample(
        windows: &Tensor,
        num_samples: usize,
        num_mini_batches: usize,
        mini_batch_size: usize,
    ) -> Result<Self> {
        if num_samples == 0 {
            bail!("Cannot sample motion windows from an empty buffer");
        }
        if num_mini_batches == 0 || mini_batch_size == 0 {
            bail!(
                "Motion minibatch count and size must be positive (got {} x {})",
                num_mini_batches,
                mini_batch_size
            );
        }

        let mut rng = rand::thread_rng();
        let indices = (0..num_mini_batches * mini_batch_size)
            .map(|_| rng.gen_range(0..num_samples) as i64)
            .collect();

        Ok(Self {
            windows: windows.shallow_clone(),
            indices,
            mini_batch_size,
            current_batch: 0,
        })
    }

    /// Number of batches this generator yields in total
    pub fn num_batches(&self) -> usize {
        self.indices.len() / self.mini_batch_size
    }
}

impl Iterator for MotionBatches {
    type Item = Tensor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_batch >= self.num_batches() {
            return None;
        }

        let start = self.current_batch * self.mini_batch_size;
        let batch_indices = &self.indices[start..start + self.mini_batch_size];
        self.current_batch += 1;

        let index = Tensor::from_slice(batch_indices).to_device(self.windows.device());
        Some(self.windows.index_select(0, &index))
    }
}

pub(crate) fn check_window_shape(windows: &Tensor, horizon: i64, obs_dim: i64) -> Result<()> {
    let size = windows.size();
    if size.len() != 3 || size[1] != horizon || size[2] != obs_dim {
        bail!(
            "Expected motion windows shaped [B, {}, {}], got {:?}",
            horizon,
            obs_dim,
            size
        );
    }
    Ok(())
}

/// Fixed-capacity ring buffer of policy motion windows
///
/// Storage is allocated once; inserts write at a cursor that wraps modulo
/// capacity, so once full every insert overwrites the oldest windows.
#[derive(Debug)]
pub struct ReplayBuffer {
    windows: Tensor,
    obs_dim: i64,
    horizon: i64,
    capacity: i64,
    step: i64,
    num_samples: i64,
}

impl ReplayBuffer {
    /// Create an empty buffer
    ///
    /// # Arguments
    /// * `obs_dim` - Per-step feature size
    /// * `horizon` - Steps per window
    /// * `capacity` - Maximum number of windows retained
    /// * `device` - Device for the backing storage
    pub fn new(obs_dim: i64, horizon: i64, capacity: usize, device: Device) -> Self {
        let capacity = capacity as i64;
        Self {
            windows: Tensor::zeros([capacity, horizon, obs_dim], (Kind::Float, device)),
            obs_dim,
            horizon,
            capacity,
            step: 0,
            num_samples: 0,
        }
    }

    /// Append a batch of windows shaped `[B, horizon, obs_dim]`
    ///
    /// When the batch is larger than the capacity only its last `capacity`
    /// rows are kept.
    pub fn insert(&mut self, windows: &Tensor) -> Result<()> {
        check_window_shape(windows, self.horizon, self.obs_dim)?;
        if self.capacity == 0 {
            return Ok(());
        }

        let mut src = windows.detach().to_kind(Kind::Float).to_device(self.windows.device());
        let mut num = src.size()[0];
        if num > self.capacity {
            src = src.narrow(0, num - self.capacity, self.capacity);
            num = self.capacity;
        }
        if num == 0 {
            return Ok(());
        }

        let start = self.step;
        tch::no_grad(|| {
            if start + num > self.capacity {
                let head = self.capacity - start;
                self.windows.narrow(0, start, head).copy_(&src.narrow(0, 0, head));
                self.windows.narrow(0, 0, num - head).copy_(&src.narrow(0, head, num - head));
                tracing::debug!("Replay buffer wrapped after {} windows", self.capacity);
            } else {
                self.windows.narrow(0, start, num).copy_(&src);
            }
        });

        self.num_samples = (self.num_samples + num).min(self.capacity);
        self.step = (start + num) % self.capacity;
        Ok(())
    }

    /// Occupied slots, in storage (not insertion) order
    pub fn windows(&self) -> Tensor {
        self.windows.narrow(0, 0, self.num_samples)
    }

    /// Number of stored windows
    pub fn len(&self) -> usize {
        self.num_samples as usize
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// Maximum number of windows
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

impl MotionSource for ReplayBuffer {
    fn feed_forward_generator(
        &self,
        num_mini_batches: usize,
        mini_batch_size: usize,
    ) -> Result<MotionBatches> {
        MotionBatches::sample(
            &self.windows,
            self.num_samples as usize,
            num_mini_batches,
            mini_batch_size,
        )
    }

    fn observation_dim(&self) -> i64 {
        self.obs_dim
    }

    fn observation_horizon(&self) -> i64 {
        self.horizon
    }
}

/// Fixed reference dataset of expert motion windows
#[derive(Debug)]
pub struct ExpertMotionData {
    windows: Tensor,
}

impl ExpertMotionData {
    /// Wrap windows shaped `[num_windows, horizon, obs_dim]`
    pub fn new(windows: Tensor) -> Result<Self> {
        if windows.dim() != 3 {
            bail!("Expected expert windows shaped [B, H, D], got {:?}", windows.size());
        }
        Ok(Self { windows: windows.detach().to_kind(Kind::Float) })
    }

    /// Cut every sliding window of length `horizon` out of reference
    /// trajectories shaped `[T_i, obs_dim]`
    ///
    /// Trajectories shorter than `horizon` contribute nothing. All
    /// trajectories must share the same `obs_dim`.
    pub fn from_trajectories(trajectories: &[Tensor], horizon: i64) -> Result<Self> {
        if horizon <= 0 {
            bail!("Window horizon must be positive, got {}", horizon);
        }

        let mut windows = Vec::new();
        let mut obs_dim = None;
        for (i, trajectory) in trajectories.iter().enumerate() {
            if trajectory.dim() != 2 {
                bail!("Reference trajectory {} must be [T, D], got {:?}", i, trajectory.size());
            }
            let dim = trajectory.size()[1];
            match obs_dim {
                Some(expected) if expected != dim => bail!(
                    "Reference trajectory {} has {} features, expected {}",
                    i,
                    dim,
                    expected
                ),
                _ => obs_dim = Some(dim),
            }
            let length = trajectory.size()[0];
            for start in 0..=(length - horizon) {
                windows.push(trajectory.narrow(0, start, horizon));
            }
        }

        if windows.is_empty() {
            bail!("No reference trajectory is at least {} steps long", horizon);
        }
        let windows = Tensor::f_stack(&windows, 0).context("Failed to stack reference windows")?;
        Self::new(windows)
    }

    /// Number of reference windows
    pub fn len(&self) -> usize {
        self.windows.size()[0] as usize
    }

    /// Check if the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All reference windows
    pub fn windows(&self) -> &Tensor {
        &self.windows
    }
}

impl MotionSource for ExpertMotionData {
    fn feed_forward_generator(
        &self,
        num_mini_batches: usize,
        mini_batch_size: usize,
    ) -> Result<MotionBatches> {
        MotionBatches::sample(&self.windows, self.len(), num_mini_batches, mini_batch_size)
    }

    fn observation_dim(&self) -> i64 {
        self.windows.size()[2]
    }

    fn observation_horizon(&self) -> i64 {
        self.windows.size()[1]
    }
}
