//! Running feature normalization for discriminator inputs and style rewards
//!
//! The discriminator sees motion windows from two streams (live policy and
//! expert reference). Both are normalized through the same running
//! statistics so the classifier cannot separate them by scale alone.

use anyhow::{Context, Result, bail};
use tch::{Device, Kind, Tensor};

/// Running mean and variance normalizer
///
/// Batches are folded in with the parallel-axis combination of Chan et al.,
/// which is Welford's update generalised to batches. The count starts at
/// zero, so the first batch's statistics are adopted exactly.
#[derive(Debug)]
pub struct RunningMeanStd {
    mean: Tensor,
    var: Tensor,
    count: f64,
    epsilon: f64,
    size: i64,
}

impl RunningMeanStd {
    /// Create a new normalizer
    ///
    /// # Arguments
    /// * `size` - Feature dimension (last axis of every input)
    /// * `epsilon` - Added to the variance before the square root
    /// * `device` - Device the statistics live on
    pub fn new(size: i64, epsilon: f64, device: Device) -> Self {
        Self {
            mean: Tensor::zeros([size], (Kind::Double, device)),
            var: Tensor::ones([size], (Kind::Double, device)),
            count: 0.0,
            epsilon,
            size,
        }
    }

    /// Fold a batch of feature vectors into the running statistics
    ///
    /// # Arguments
    /// * `batch` - Tensor whose last dimension equals `size`; leading
    ///   dimensions are treated as samples
    pub fn update(&mut self, batch: &Tensor) -> Result<()> {
        if batch.size().last() != Some(&self.size) {
            bail!(
                "Normalizer expects a last dimension of {}, got shape {:?}",
                self.size,
                batch.size()
            );
        }
        let batch = batch.detach().to_kind(Kind::Double).to_device(self.mean.device());
        let batch = batch.f_reshape([-1, self.size]).context("Failed to flatten normalizer batch")?;
        let batch_size = batch.size()[0];
        if batch_size == 0 {
            return Ok(());
        }

        let n = batch_size as f64;
        let total_count = self.count + n;

        tch::no_grad(|| {
            let batch_mean = batch.mean_dim(0, false, Kind::Double);
            let batch_var = (&batch - &batch_mean).square().mean_dim(0, false, Kind::Double);

            let delta = &batch_mean - &self.mean;
            let mean = &self.mean + &delta * (n / total_count);

            let m_a = &self.var * self.count;
            let m_b = batch_var * n;
            let m2 = m_a + m_b + delta.square() * (self.count * n / total_count);

            self.mean = mean;
            self.var = m2 / total_count;
        });

        self.count = total_count;
        Ok(())
    }

    /// Normalize `x` as `(x - mean) / sqrt(var + eps)`
    ///
    /// Broadcasts over every leading dimension and returns a tensor of the
    /// same kind as the input. Never mutates the statistics.
    pub fn normalize(&self, x: &Tensor) -> Tensor {
        let kind = x.kind();
        let device = x.device();
        let mean = self.mean.to_kind(kind).to_device(device);
        let std = (&self.var + self.epsilon).sqrt().to_kind(kind).to_device(device);
        (x - mean) / std
    }

    /// Current mean
    pub fn mean(&self) -> Result<Vec<f64>> {
        Ok(Vec::<f64>::try_from(&self.mean)?)
    }

    /// Current standard deviation, `sqrt(var + eps)`
    pub fn std(&self) -> Result<Vec<f64>> {
        Ok(Vec::<f64>::try_from(&(&self.var + self.epsilon).sqrt())?)
    }

    /// Number of samples folded in so far
    pub fn count(&self) -> f64 {
        self.count
    }

    /// Feature dimension
    pub fn size(&self) -> i64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(rows: &[&[f32]]) -> Tensor {
        let cols = rows[0].len() as i64;
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_slice(&flat).view([-1, cols])
    }

    #[test]
    fn test_normalize_basic() {
        let mut normalizer = RunningMeanStd::new(2, 1e-8, Device::Cpu);

        normalizer.update(&tensor(&[&[1.0, 2.0], &[2.0, 4.0], &[3.0, 6.0]])).unwrap();

        let mean = normalizer.mean().unwrap();
        assert!((mean[0] - 2.0).abs() < 1e-6);
        assert!((mean[1] - 4.0).abs() < 1e-6);

        let normalized = normalizer.normalize(&Tensor::from_slice(&[2.0_f32, 4.0]));
        let normalized: Vec<f32> = Vec::try_from(&normalized).unwrap();
        assert!(normalized[0].abs() < 1e-5);
        assert!(normalized[1].abs() < 1e-5);
    }

    #[test]
    fn test_batch_equal_to_its_mean_normalizes_to_zero() {
        let mut normalizer = RunningMeanStd::new(3, 1e-8, Device::Cpu);
        let batch = tensor(&[&[0.5, -1.5, 7.0], &[0.5, -1.5, 7.0]]);

        normalizer.update(&batch).unwrap();
        let out = normalizer.normalize(&batch);

        let max_abs = f64::try_from(&out.abs().max()).unwrap();
        assert!(max_abs < 1e-4, "expected near-zero output, got {}", max_abs);
    }

    #[test]
    fn test_incremental_update_matches_batch_statistics() {
        let mut incremental = RunningMeanStd::new(1, 1e-8, Device::Cpu);
        incremental.update(&tensor(&[&[1.0]])).unwrap();
        incremental.update(&tensor(&[&[2.0], &[3.0]])).unwrap();
        incremental.update(&tensor(&[&[4.0]])).unwrap();

        let mut batched = RunningMeanStd::new(1, 1e-8, Device::Cpu);
        batched.update(&tensor(&[&[1.0], &[2.0], &[3.0], &[4.0]])).unwrap();

        assert!((incremental.mean().unwrap()[0] - 2.5).abs() < 1e-9);
        assert!((incremental.mean().unwrap()[0] - batched.mean().unwrap()[0]).abs() < 1e-9);
        assert!((incremental.std().unwrap()[0] - batched.std().unwrap()[0]).abs() < 1e-9);
        assert_eq!(incremental.count(), 4.0);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut normalizer = RunningMeanStd::new(2, 1e-8, Device::Cpu);
        normalizer.update(&Tensor::zeros([0, 2], (Kind::Float, Device::Cpu))).unwrap();
        assert_eq!(normalizer.count(), 0.0);
        assert_eq!(normalizer.mean().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_normalize_broadcasts_over_horizon() {
        let mut normalizer = RunningMeanStd::new(2, 1e-8, Device::Cpu);
        normalizer.update(&tensor(&[&[0.0, 10.0], &[2.0, 30.0]])).unwrap();

        let windows = Tensor::ones([4, 3, 2], (Kind::Float, Device::Cpu));
        let out = normalizer.normalize(&windows);

        assert_eq!(out.size(), vec![4, 3, 2]);
        let first: Vec<f32> = Vec::try_from(&out.get(0).get(0)).unwrap();
        assert!(first[0].abs() < 1e-5);
        assert!((first[1] + 1.9).abs() < 1e-4);
    }

    #[test]
    fn test_update_rejects_wrong_feature_size() {
        let mut normalizer = RunningMeanStd::new(3, 1e-8, Device::Cpu);
        assert!(normalizer.update(&Tensor::zeros([4, 2], (Kind::Float, Device::Cpu))).is_err());
        assert_eq!(normalizer.count(), 0.0);
    }
}
