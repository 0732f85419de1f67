//! Tests for rollout storage functionality

use tch::{Device, Kind, Tensor};

use super::{RolloutStorage, Transition};

fn floats(t: &Tensor) -> Vec<f32> {
    Vec::try_from(&t.to_kind(Kind::Float).reshape([-1])).unwrap()
}

fn column(values: &[f32]) -> Tensor {
    Tensor::from_slice(values).reshape([-1, 1, 1])
}

/// Transition whose observations encode the global sample id `t * N + n`
fn transition(step: usize, num_envs: usize, dones: &[f32]) -> Transition {
    let n = num_envs as i64;
    let ids = Tensor::arange(n, (Kind::Float, Device::Cpu)) + (step * num_envs) as f64;
    Transition {
        observations: Some(Tensor::stack(&[&ids, &ids], 1)),
        critic_observations: Some(Tensor::zeros([n, 2], (Kind::Float, Device::Cpu))),
        privileged_observations: Some(Tensor::ones([n, 1], (Kind::Float, Device::Cpu))),
        observation_histories: Some(Tensor::zeros([n, 3], (Kind::Float, Device::Cpu))),
        actions: Some(Tensor::zeros([n, 2], (Kind::Float, Device::Cpu))),
        rewards: Some(Tensor::ones([n], (Kind::Float, Device::Cpu))),
        dones: Some(Tensor::from_slice(dones)),
        values: Some(Tensor::zeros([n, 1], (Kind::Float, Device::Cpu))),
        actions_log_prob: Some(Tensor::zeros([n], (Kind::Float, Device::Cpu))),
        action_mean: Some(Tensor::zeros([n, 2], (Kind::Float, Device::Cpu))),
        action_sigma: Some(Tensor::ones([n, 2], (Kind::Float, Device::Cpu))),
        env_bins: None,
    }
}

fn empty_storage(num_envs: usize, num_steps: usize) -> RolloutStorage {
    RolloutStorage::new(num_envs, num_steps, &[2], &[1], &[3], &[2], Device::Cpu)
}

fn filled_storage(num_envs: usize, num_steps: usize) -> RolloutStorage {
    let mut storage = empty_storage(num_envs, num_steps);
    let dones = vec![0.0; num_envs];
    for step in 0..num_steps {
        storage.add_transitions(&transition(step, num_envs, &dones)).unwrap();
    }
    storage
        .compute_returns(&Tensor::zeros([num_envs as i64, 1], (Kind::Float, Device::Cpu)), 0.99, 0.95)
        .unwrap();
    storage
}

#[cfg(test)]
mod gae_tests {
    use super::*;
    use crate::buffer::rollout::{compute_gae, normalize_advantages};

    #[test]
    fn test_done_stops_bootstrap() {
        // Step 0 ends an episode, so its advantage only sees its own reward
        let rewards = column(&[1.0, 1.0]);
        let values = column(&[0.5, 0.5]);
        let dones = column(&[1.0, 0.0]);
        let last_values = Tensor::from_slice(&[10.0f32]);

        let (advantages, returns) = compute_gae(&rewards, &values, &dones, &last_values, 0.99, 0.95);
        let advantages = floats(&advantages);
        let returns = floats(&returns);

        assert!((advantages[1] - 10.4).abs() < 1e-4, "Bootstrapped advantage: {}", advantages[1]);
        assert!((advantages[0] - 0.5).abs() < 1e-6, "Terminal advantage: {}", advantages[0]);
        assert!((returns[0] - 1.0).abs() < 1e-6);
        assert!((returns[1] - 10.9).abs() < 1e-4);
    }

    #[test]
    fn test_gae_simple_episode() {
        let rewards = column(&[1.0, 1.0, 1.0]);
        let values = column(&[2.0, 2.0, 2.0]);
        let dones = column(&[0.0, 0.0, 1.0]);
        let last_values = Tensor::from_slice(&[5.0f32]);

        let (advantages, _) = compute_gae(&rewards, &values, &dones, &last_values, 0.99, 0.95);
        let advantages = floats(&advantages);

        // Final step: delta = 1 - 2, no bootstrap past the done
        assert!((advantages[2] + 1.0).abs() < 1e-6);
        // Middle step: 0.98 + 0.99 * 0.95 * (-1)
        assert!((advantages[1] - 0.0395).abs() < 1e-4);
    }

    #[test]
    fn test_single_step_zero_reward() {
        let zero = column(&[0.0]);
        let (advantages, returns) =
            compute_gae(&zero, &zero, &zero, &Tensor::from_slice(&[0.0f32]), 0.99, 0.95);

        assert_eq!(floats(&advantages), vec![0.0]);
        assert_eq!(floats(&returns), vec![0.0]);
    }

    #[test]
    fn test_returns_equal_advantages_plus_values() {
        let rewards = Tensor::randn([5, 3, 1], (Kind::Float, Device::Cpu));
        let values = Tensor::randn([5, 3, 1], (Kind::Float, Device::Cpu));
        let dones = Tensor::zeros([5, 3, 1], (Kind::Float, Device::Cpu));
        let last_values = Tensor::randn([3, 1], (Kind::Float, Device::Cpu));

        let (advantages, returns) = compute_gae(&rewards, &values, &dones, &last_values, 0.9, 0.8);
        let diff = f64::try_from(&(returns - advantages - values).abs().max()).unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_normalize_advantages() {
        let advantages = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).reshape([4, 1, 1]);
        let normalized = normalize_advantages(&advantages);

        let mean = f64::try_from(&normalized.mean(Kind::Float)).unwrap();
        let std = f64::try_from(&normalized.std(false)).unwrap();
        assert!(mean.abs() < 1e-6);
        assert!((std - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_normalize_single_sample_is_finite() {
        let normalized = normalize_advantages(&column(&[3.0]));
        assert_eq!(floats(&normalized), vec![0.0]);
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    #[test]
    fn test_add_until_full() {
        let mut storage = empty_storage(2, 3);
        assert!(storage.is_empty());

        for step in 0..3 {
            storage.add_transitions(&transition(step, 2, &[0.0, 0.0])).unwrap();
        }
        assert!(storage.is_full());
        assert_eq!(storage.len(), 6);

        let err = storage.add_transitions(&transition(3, 2, &[0.0, 0.0])).unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_clear_resets_pointer() {
        let mut storage = filled_storage(2, 2);
        storage.clear();

        assert_eq!(storage.step(), 0);
        assert!(storage.is_empty());
        storage.add_transitions(&transition(0, 2, &[0.0, 0.0])).unwrap();
        assert_eq!(storage.step(), 1);
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let mut storage = empty_storage(2, 2);
        let mut partial = transition(0, 2, &[0.0, 0.0]);
        partial.actions = None;

        let err = storage.add_transitions(&partial).unwrap_err();
        assert!(err.to_string().contains("actions"));
        assert_eq!(storage.step(), 0);
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let mut storage = empty_storage(2, 2);
        let mut bad = transition(0, 2, &[0.0, 0.0]);
        bad.observations = Some(Tensor::zeros([2, 5], (Kind::Float, Device::Cpu)));

        assert!(storage.add_transitions(&bad).is_err());
    }

    #[test]
    fn test_missing_env_bins_default_to_zero() {
        let storage = filled_storage(2, 2);
        assert!(floats(storage.env_bins()).iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_compute_returns_requires_full_storage() {
        let mut storage = empty_storage(2, 2);
        storage.add_transitions(&transition(0, 2, &[0.0, 0.0])).unwrap();

        let last_values = Tensor::zeros([2, 1], (Kind::Float, Device::Cpu));
        assert!(storage.compute_returns(&last_values, 0.99, 0.95).is_err());
    }

    #[test]
    fn test_generator_requires_returns() {
        let mut storage = empty_storage(1, 1);
        storage.add_transitions(&transition(0, 1, &[0.0])).unwrap();
        assert!(storage.mini_batch_generator(1, 1).is_err());
    }
}

#[cfg(test)]
mod sampling_tests {
    use super::*;
    use crate::buffer::rollout::{split_and_pad_trajectories, unpad_trajectories};

    #[test]
    fn test_minibatch_partition_per_epoch() {
        let storage = filled_storage(4, 4);
        let generator = storage.mini_batch_generator(4, 3).unwrap();
        assert_eq!(generator.num_batches(), 12);
        assert_eq!(generator.mini_batch_size(), 4);

        let batches: Vec<_> = generator.collect();
        assert_eq!(batches.len(), 12);

        for epoch in batches.chunks(4) {
            let mut ids: Vec<i64> = epoch
                .iter()
                .flat_map(|b| floats(&b.observations.select(1, 0)))
                .map(|id| id as i64)
                .collect();
            ids.sort_unstable();
            assert_eq!(ids, (0..16).collect::<Vec<_>>());
        }
        assert_eq!(batches[0].returns.size(), vec![4, 1]);
        assert!(batches[0].masks.is_none());
    }

    #[test]
    fn test_remainder_is_dropped() {
        let storage = filled_storage(5, 1);
        let batches: Vec<_> = storage.mini_batch_generator(2, 1).unwrap().collect();

        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.size() == 2));
    }

    #[test]
    fn test_invalid_minibatch_counts() {
        let storage = filled_storage(2, 2);
        assert!(storage.mini_batch_generator(0, 1).is_err());
        assert!(storage.mini_batch_generator(5, 1).is_err());
    }

    #[test]
    fn test_split_and_pad_trajectories() {
        // env 0 finishes an episode at step 1, env 1 runs uninterrupted
        let data = Tensor::arange(8, (Kind::Float, Device::Cpu)).reshape([4, 2, 1]);
        let dones = Tensor::from_slice(&[0.0f32, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]).reshape([4, 2]);

        let (padded, masks, per_env) = split_and_pad_trajectories(&data, &dones).unwrap();

        assert_eq!(per_env, vec![2, 1]);
        assert_eq!(padded.size(), vec![4, 3, 1]);
        assert_eq!(masks.size(), vec![4, 3]);
        assert_eq!(i64::try_from(&masks.sum(Kind::Int64)).unwrap(), 8);

        // Second trajectory of env 0 starts at step 2 and is padded after 2 steps
        assert_eq!(floats(&padded.select(1, 1)), vec![4.0, 6.0, 0.0, 0.0]);
        assert_eq!(floats(&padded.select(1, 2)), vec![1.0, 3.0, 5.0, 7.0]);

        let restored = unpad_trajectories(&padded, &masks);
        assert_eq!(floats(&restored), floats(&data));
    }

    #[test]
    fn test_recurrent_generator_slices_envs() {
        let mut storage = empty_storage(4, 3);
        storage.add_transitions(&transition(0, 4, &[0.0, 1.0, 0.0, 0.0])).unwrap();
        storage.add_transitions(&transition(1, 4, &[0.0, 0.0, 0.0, 0.0])).unwrap();
        storage.add_transitions(&transition(2, 4, &[0.0, 0.0, 0.0, 0.0])).unwrap();
        storage
            .compute_returns(&Tensor::zeros([4, 1], (Kind::Float, Device::Cpu)), 0.99, 0.95)
            .unwrap();

        let batches: Vec<_> = storage.recurrent_mini_batch_generator(2, 1).unwrap().collect();
        assert_eq!(batches.len(), 2);

        // env 1 is split in two, so the first batch holds three trajectories
        let masks = batches[0].masks.as_ref().unwrap();
        assert_eq!(masks.size(), vec![3, 3]);
        assert_eq!(i64::try_from(&masks.sum(Kind::Int64)).unwrap(), 6);
        assert_eq!(batches[0].actions.size(), vec![3, 2, 2]);
        assert_eq!(batches[1].observations.size(), vec![3, 2, 2]);
    }
}
