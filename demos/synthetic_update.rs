//! Train LIPS on a synthetic point-mass task
//!
//! A batch of 2-D point masses is pushed around by the policy. The task
//! reward pulls them towards the origin, and the style reward pulls their
//! motion towards expert circles. Privileged observations hold a hidden
//! per-env drag coefficient that the adaptation module learns to infer.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --example synthetic_update --release
//! ```

use anyhow::Result;
use lips_rl::prelude::*;
use tch::{Device, Kind, Tensor};

const NUM_ENVS: i64 = 32;
const NUM_STEPS: usize = 24;
const NUM_UPDATES: usize = 20;
const HISTORY_LEN: i64 = 4;
const STATE_DIM: i64 = 4; // position + velocity
const ACTION_DIM: i64 = 2;
const HORIZON: i64 = 2;
const DT: f64 = 0.05;
const STYLE_WEIGHT: f64 = 0.5;

/// Expert trajectories: unit circles at varying speed
fn expert_circles(device: Device) -> Result<ExpertMotionData> {
    let trajectories: Vec<Tensor> = (1..=8)
        .map(|k| {
            let t = Tensor::arange(200, (Kind::Float, device)) * (DT * k as f64 * 0.5);
            let (sin, cos) = (t.sin(), t.cos());
            Tensor::stack(&[&cos, &sin, &(-&sin * (k as f64 * 0.5)), &(&cos * (k as f64 * 0.5))], 1)
        })
        .collect();
    ExpertMotionData::from_trajectories(&trajectories, HORIZON)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let device = Device::cuda_if_available();
    tracing::info!("Synthetic LIPS training on {:?}", device);

    let history_dim = HISTORY_LEN * STATE_DIM;
    let policy = MlpActorCritic::with_config(history_dim, 1, ACTION_DIM, MlpConfig::default(), device);
    let discriminator = MlpDiscriminator::new(STATE_DIM, HORIZON, 64, device);
    let expert = expert_circles(device)?;
    tracing::info!("  Expert windows: {}", expert.len());

    let config = LipsConfig::new()
        .num_learning_epochs(4)
        .discriminator(DiscriminatorConfig::new().num_mini_batches(8).replay_buffer_size(20_000));

    let mut trainer = LipsTrainer::new(config, policy, discriminator, expert, device)?
        .with_state_normalizer(RunningMeanStd::new(STATE_DIM, 1e-8, device))?;
    trainer.init_storage(
        NUM_ENVS as usize,
        NUM_STEPS,
        &[STATE_DIM],
        &[1],
        &[history_dim],
        &[ACTION_DIM],
    );
    trainer.train_mode();

    let opts = (Kind::Float, device);
    let drag = Tensor::rand([NUM_ENVS, 1], opts);
    let mut state = Tensor::randn([NUM_ENVS, STATE_DIM], opts);
    let mut history = state.repeat([1, HISTORY_LEN]);
    let mut window = state.unsqueeze(1).repeat([1, HORIZON, 1]);

    for update in 0..NUM_UPDATES {
        let mut episode_reward = 0.0;

        for _ in 0..NUM_STEPS {
            let actions = trainer.act(&state, &drag, &history, &window)?.clamp(-1.0, 1.0);

            // Integrate: velocity += (action - drag * velocity) * dt
            let position = state.narrow(1, 0, 2);
            let velocity = state.narrow(1, 2, 2);
            let velocity = &velocity + (&actions - &velocity * &drag) * DT;
            let position = &position + &velocity * DT;
            let next_state = Tensor::cat(&[&position, &velocity], 1);

            let next_window = Tensor::cat(&[window.narrow(1, 1, HORIZON - 1), next_state.unsqueeze(1)], 1);
            let (style_reward, _) = trainer.style_reward(&next_window)?;
            let task_reward = (-position.square().sum_dim_intlist(-1, false, Kind::Float)).exp();
            let rewards = &task_reward + style_reward * STYLE_WEIGHT;
            episode_reward += f64::try_from(&rewards.mean(Kind::Float))?;

            let dones = Tensor::zeros([NUM_ENVS], opts);
            trainer.process_env_step(&rewards, &dones, &StepInfos::default(), &next_state)?;

            history = Tensor::cat(&[history.narrow(1, STATE_DIM, history_dim - STATE_DIM), next_state.shallow_clone()], 1);
            window = next_window;
            state = next_state;
        }

        trainer.compute_returns(&history, &drag)?;
        let stats = trainer.update()?;
        tracing::info!(
            "Update {:>3}: reward/step={:.3}, adaptation={:.4}, expert/policy pred={:.2}/{:.2}",
            update,
            episode_reward / NUM_STEPS as f64,
            stats.adaptation_loss,
            stats.expert_pred,
            stats.policy_pred
        );

        if !stats.is_finite() {
            anyhow::bail!("Training diverged at update {}", update);
        }
    }

    trainer.test_mode();
    tracing::info!("✅ Done after {} updates", trainer.total_updates());
    Ok(())
}
