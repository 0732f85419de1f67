//! Multi-Layer Perceptron (MLP) actor-critic with an adaptation module
//!
//! Continuous-action Gaussian policy using tch-rs. The adaptation module
//! estimates the privileged state from the observation history, and the
//! actor consumes that estimate next to the history. The critic sees the
//! true privileged state instead.
//!
//! # Architecture
//!
//! ```text
//!  obs_history ───────────────┬──────────────────────┐
//!        |                    |                      |
//!  [Adaptation MLP]           |                      |
//!        |                    |                      |
//!   latent (priv_dim)         |             privileged_obs
//!        \                    |                      |
//!         └── concat ─────────┘         concat ──────┘
//!               |                          |
//!          [Actor MLP]                [Critic MLP]
//!               |                          |
//!        action mean, exp(log_std)      value
//! ```
//!
//! All parameters share one `VarStore`. The adaptation module is created
//! in optimizer group [`ADAPTATION_GROUP`], so the policy loss reaches it
//! through the actor while its own optimizer leaves the actor and critic
//! alone.

use tch::{
    Device, Tensor,
    nn::{self, Init, Module},
};

use super::{ADAPTATION_GROUP, ActorCritic, DiagGaussian};

/// Configuration for MLP architecture
#[derive(Debug, Clone)]
pub struct MlpConfig {
    pub num_layers: usize,
    pub hidden_dim: i64,
    pub adaptation_hidden_dim: i64,
    pub init_noise_std: f64,
    pub use_orthogonal_init: bool,
    pub activation: Activation,
}

#[derive(Debug, Clone, Copy)]
pub enum Activation {
    ReLU,
    Tanh,
    Elu,
}

impl Activation {
    fn apply(self, x: &Tensor) -> Tensor {
        match self {
            Activation::ReLU => x.relu(),
            Activation::Tanh => x.tanh(),
            Activation::Elu => x.elu(),
        }
    }
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            hidden_dim: 128,
            adaptation_hidden_dim: 64,
            init_noise_std: 1.0,
            use_orthogonal_init: true,
            activation: Activation::Elu,
        }
    }
}

/// Build `num_layers` hidden layers followed by a linear output layer
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_mlp(
    path: nn::Path,
    in_dim: i64,
    hidden_dim: i64,
    num_layers: usize,
    out_dim: i64,
    activation: Activation,
    use_orthogonal_init: bool,
    output_gain: f64,
) -> nn::Sequential {
    let (hidden_init, output_init) = if use_orthogonal_init {
        (Init::Orthogonal { gain: 2.0_f64.sqrt() }, Init::Orthogonal { gain: output_gain })
    } else {
        (Init::Randn { mean: 0.0, stdev: 0.01 }, Init::Randn { mean: 0.0, stdev: 0.01 })
    };

    let mut hidden_config = nn::LinearConfig::default();
    hidden_config.ws_init = hidden_init;
    let mut output_config = nn::LinearConfig::default();
    output_config.ws_init = output_init;

    let mut seq = nn::seq();
    let mut dim = in_dim;
    for i in 0..num_layers {
        seq = seq
            .add(nn::linear(&path / format!("fc{}", i + 1), dim, hidden_dim, hidden_config))
            .add_fn(move |x| activation.apply(x));
        dim = hidden_dim;
    }
    seq.add(nn::linear(&path / "out", dim, out_dim, output_config))
}

/// Gaussian actor-critic with an adaptation module
pub struct MlpActorCritic {
    vs: nn::VarStore,
    actor: nn::Sequential,
    critic: nn::Sequential,
    adaptation: nn::Sequential,
    log_std: Tensor,
    distribution: Option<DiagGaussian>,
    device: Device,
    config: MlpConfig,
}

impl MlpActorCritic {
    /// Create a new actor-critic with the default architecture
    ///
    /// # Arguments
    ///
    /// * `obs_history_dim` - Flattened observation-history size
    /// * `privileged_dim` - Privileged observation size (adaptation target)
    /// * `action_dim` - Continuous action size
    pub fn new(obs_history_dim: i64, privileged_dim: i64, action_dim: i64) -> Self {
        let device = Device::cuda_if_available();
        tracing::info!("MlpActorCritic using device: {:?}", device);
        Self::with_config(obs_history_dim, privileged_dim, action_dim, MlpConfig::default(), device)
    }

    /// Create a new actor-critic with custom configuration
    pub fn with_config(
        obs_history_dim: i64,
        privileged_dim: i64,
        action_dim: i64,
        config: MlpConfig,
        device: Device,
    ) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let actor = build_mlp(
            &root / "actor",
            obs_history_dim + privileged_dim,
            config.hidden_dim,
            config.num_layers,
            action_dim,
            config.activation,
            config.use_orthogonal_init,
            0.01,
        );
        let critic = build_mlp(
            &root / "critic",
            obs_history_dim + privileged_dim,
            config.hidden_dim,
            config.num_layers,
            1,
            config.activation,
            config.use_orthogonal_init,
            1.0,
        );
        let log_std =
            root.var("log_std", &[action_dim], Init::Const(config.init_noise_std.ln()));

        let adaptation = build_mlp(
            &root.set_group(ADAPTATION_GROUP) / "adaptation",
            obs_history_dim,
            config.adaptation_hidden_dim,
            config.num_layers,
            privileged_dim,
            config.activation,
            config.use_orthogonal_init,
            1.0,
        );

        Self {
            vs,
            actor,
            critic,
            adaptation,
            log_std,
            distribution: None,
            device,
            config,
        }
    }

    fn action_mean_for(&self, obs_history: &Tensor) -> Tensor {
        let latent = self.adaptation.forward(obs_history);
        self.actor.forward(&Tensor::cat(&[obs_history, &latent], -1))
    }

    /// Device the parameters live on
    pub fn device(&self) -> Device {
        self.device
    }

    /// Architecture configuration
    pub fn config(&self) -> &MlpConfig {
        &self.config
    }
}

impl ActorCritic for MlpActorCritic {
    fn act(&mut self, obs_history: &Tensor, _masks: Option<&Tensor>) -> Tensor {
        let mean = self.action_mean_for(obs_history);
        let std = self.log_std.exp().expand_as(&mean);
        let distribution = DiagGaussian::new(mean, std);
        let actions = distribution.sample();
        self.distribution = Some(distribution);
        actions
    }

    fn act_inference(&self, obs_history: &Tensor) -> Tensor {
        self.action_mean_for(obs_history)
    }

    fn evaluate(
        &self,
        obs_history: &Tensor,
        privileged_obs: &Tensor,
        _masks: Option<&Tensor>,
    ) -> Tensor {
        self.critic.forward(&Tensor::cat(&[obs_history, privileged_obs], -1))
    }

    fn distribution(&self) -> Option<&DiagGaussian> {
        self.distribution.as_ref()
    }

    fn adaptation_module(&self, obs_history: &Tensor) -> Tensor {
        self.adaptation.forward(obs_history)
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}
