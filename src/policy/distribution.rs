//! Diagonal Gaussian action distribution

use std::f64::consts::PI;

use tch::{Kind, Tensor};

/// Gaussian with independent per-dimension standard deviations
///
/// Log-probabilities and entropies are summed over the last (action)
/// dimension, so a `[B, A]` distribution yields `[B]` values.
#[derive(Debug)]
pub struct DiagGaussian {
    mean: Tensor,
    std: Tensor,
}

impl DiagGaussian {
    /// Create a distribution from its mean and standard deviation
    pub fn new(mean: Tensor, std: Tensor) -> Self {
        Self { mean, std }
    }

    /// Draw one reparameterised sample (no gradient)
    pub fn sample(&self) -> Tensor {
        tch::no_grad(|| &self.mean + &self.std * self.mean.randn_like())
    }

    /// Log-probability of `actions`, summed over the action dimension
    pub fn log_prob(&self, actions: &Tensor) -> Tensor {
        let var = self.std.square();
        let log_density = -(actions - &self.mean).square() / (var * 2.0)
            - self.std.log()
            - 0.5 * (2.0 * PI).ln();
        log_density.sum_dim_intlist(-1, false, Kind::Float)
    }

    /// Entropy, summed over the action dimension
    pub fn entropy(&self) -> Tensor {
        (self.std.log() + 0.5 + 0.5 * (2.0 * PI).ln()).sum_dim_intlist(-1, false, Kind::Float)
    }

    /// Distribution mean
    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Distribution standard deviation
    pub fn std(&self) -> &Tensor {
        &self.std
    }

    /// Closed-form KL(old || new) between two diagonal Gaussians
    ///
    /// Returns one value per sample (summed over the action dimension).
    /// A `1e-5` guard keeps the log finite when the new std collapses.
    pub fn kl(old_mean: &Tensor, old_std: &Tensor, mean: &Tensor, std: &Tensor) -> Tensor {
        let log_ratio = (std / old_std + 1e-5).log();
        let spread = (old_std.square() + (old_mean - mean).square()) / (std.square() * 2.0);
        (log_ratio + spread - 0.5).sum_dim_intlist(-1, false, Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_standard_normal_log_prob_at_mean() {
        let dist = DiagGaussian::new(
            Tensor::zeros([1, 2], (Kind::Float, Device::Cpu)),
            Tensor::ones([1, 2], (Kind::Float, Device::Cpu)),
        );
        let log_prob = dist.log_prob(&Tensor::zeros([1, 2], (Kind::Float, Device::Cpu)));
        let expected = -(2.0 * PI).ln();
        assert!((f64::try_from(&log_prob).unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn test_kl_of_identical_distributions_is_near_zero() {
        let mean = Tensor::from_slice(&[0.3_f32, -1.2]).view([1, 2]);
        let std = Tensor::from_slice(&[0.5_f32, 2.0]).view([1, 2]);
        let kl = DiagGaussian::kl(&mean, &std, &mean, &std);
        assert!(f64::try_from(&kl).unwrap().abs() < 1e-4);
    }

    #[test]
    fn test_kl_grows_with_mean_shift() {
        let std = Tensor::ones([1, 1], (Kind::Float, Device::Cpu));
        let old_mean = Tensor::zeros([1, 1], (Kind::Float, Device::Cpu));
        let near = DiagGaussian::kl(&old_mean, &std, &(old_mean.ones_like() * 0.1), &std);
        let far = DiagGaussian::kl(&old_mean, &std, &(old_mean.ones_like() * 1.0), &std);
        assert!(f64::try_from(&far).unwrap() > f64::try_from(&near).unwrap());
        // mean shift of 1 with unit variance: KL = 0.5
        assert!((f64::try_from(&far).unwrap() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_entropy_increases_with_std() {
        let mean = Tensor::zeros([1, 3], (Kind::Float, Device::Cpu));
        let narrow = DiagGaussian::new(mean.shallow_clone(), mean.ones_like() * 0.5);
        let wide = DiagGaussian::new(mean.shallow_clone(), mean.ones_like() * 2.0);
        assert!(f64::try_from(&wide.entropy()).unwrap() > f64::try_from(&narrow.entropy()).unwrap());
    }
}
