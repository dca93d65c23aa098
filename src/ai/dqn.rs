use std::path::Path;

use burn::backend::Autodiff;
use burn::backend::NdArray;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{AdamW, AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{DefaultRecorder, Recorder};
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::action::NUM_ACTIONS;
use crate::ai::network::{QNetwork, QNetworkConfig};
use crate::checkpoint::TrainingState;
use crate::error::CheckpointError;
use crate::replay::ReplayBuffer;

pub type InferBackend = NdArray<f32>;
pub type TrainBackend = Autodiff<InferBackend>;

type DqnOptimizer = OptimizerAdaptor<AdamW, QNetwork<TrainBackend>, TrainBackend>;
type OptimizerRecord = <DqnOptimizer as Optimizer<QNetwork<TrainBackend>, TrainBackend>>::Record;

/// Huber loss transition point.
const HUBER_DELTA: f32 = 1.0;
/// Warn about near-zero gradients every this many training steps.
const GRAD_CHECK_INTERVAL: usize = 100;
const GRAD_NORM_FLOOR: f32 = 1e-3;
/// Emit a training diagnostics line every this many training steps.
const LOG_INTERVAL: usize = 20;

/// DQN hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DqnConfig {
    /// When false the engine runs with a uniform-random policy and no
    /// approximator.
    pub enabled: bool,
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub dropout: f64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub gamma: f32,
    pub batch_size: usize,
    pub replay_capacity: usize,
    pub epsilon_start: f32,
    pub epsilon_min: f32,
    pub epsilon_decay: f32,
    pub epsilon_restart: f32,
    pub update_target_every: usize,
    pub save_every: usize,
    pub lr_step_size: usize,
    pub lr_gamma: f64,
    pub lr_floor: f64,
    pub lr_restart: f64,
    pub max_grad_norm: f32,
}

impl Default for DqnConfig {
    fn default() -> Self {
        DqnConfig {
            enabled: true,
            input_dim: 3185,
            hidden_dim: 512,
            dropout: 0.1,
            learning_rate: 3e-4,
            weight_decay: 1e-3,
            gamma: 0.99,
            batch_size: 128,
            replay_capacity: 50_000,
            epsilon_start: 1.0,
            epsilon_min: 0.15,
            epsilon_decay: 0.9995,
            epsilon_restart: 0.2,
            update_target_every: 100,
            save_every: 1000,
            lr_step_size: 2000,
            lr_gamma: 0.95,
            lr_floor: 1e-4,
            lr_restart: 2e-4,
            max_grad_norm: 1.0,
        }
    }
}

/// Step-decay learning-rate schedule: the rate is multiplied by `gamma` once
/// every `step_size` training steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLrSchedule {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    steps: usize,
}

impl StepLrSchedule {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        StepLrSchedule {
            base_lr,
            step_size,
            gamma,
            steps: 0,
        }
    }

    pub fn step(&mut self) {
        self.steps += 1;
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.gamma.powi((self.steps / self.step_size) as i32)
    }
}

/// Online + target dueling Q-networks with an AdamW optimizer and the
/// exploration / learning-rate schedules. One learner drives both the greedy
/// side of decisions and the Double-DQN training updates.
pub struct DqnLearner {
    q_network: QNetwork<TrainBackend>,
    target_network: QNetwork<InferBackend>,
    optimizer: DqnOptimizer,
    scheduler: StepLrSchedule,
    config: DqnConfig,
    device: <TrainBackend as Backend>::Device,
    epsilon: f32,
    train_count: usize,
    last_checkpoint_count: usize,
}

impl DqnLearner {
    pub fn new(config: DqnConfig) -> Self {
        let device = Default::default();
        let net_config = Self::network_config(&config);
        let q_network: QNetwork<TrainBackend> = net_config.init(&device);
        // Target starts as a verbatim copy of the online parameters.
        let target_network = q_network.valid();
        let optimizer = Self::build_optimizer(&config);
        let scheduler =
            StepLrSchedule::new(config.learning_rate, config.lr_step_size, config.lr_gamma);
        let epsilon = config.epsilon_start;

        DqnLearner {
            q_network,
            target_network,
            optimizer,
            scheduler,
            config,
            device,
            epsilon,
            train_count: 0,
            last_checkpoint_count: 0,
        }
    }

    fn network_config(config: &DqnConfig) -> QNetworkConfig {
        QNetworkConfig::new()
            .with_input_dim(config.input_dim)
            .with_hidden_dim(config.hidden_dim)
            .with_dropout(config.dropout)
    }

    fn build_optimizer(config: &DqnConfig) -> DqnOptimizer {
        AdamWConfig::new()
            .with_weight_decay(config.weight_decay as f32)
            .init()
    }

    pub fn config(&self) -> &DqnConfig {
        &self.config
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn train_count(&self) -> usize {
        self.train_count
    }

    pub fn last_checkpoint_count(&self) -> usize {
        self.last_checkpoint_count
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.current_lr()
    }

    /// Q-values for a single observation, through the inference-mode online
    /// network (dropout off). Returns `None` on an observation length
    /// mismatch.
    pub fn q_values(&self, obs: &[f32]) -> Option<Vec<f32>> {
        if obs.len() != self.config.input_dim {
            warn!(
                expected = self.config.input_dim,
                got = obs.len(),
                "observation length mismatch, skipping greedy evaluation"
            );
            return None;
        }
        let tensor = Tensor::<InferBackend, 1>::from_data(TensorData::from(obs), &self.device)
            .reshape([1, obs.len() as i32]);
        let q = self.q_network.valid().forward(tensor);
        Some(q.into_data().to_vec().expect("f32 tensor data extraction"))
    }

    /// Copy the online parameters into the target network verbatim.
    pub fn sync_target(&mut self) {
        self.target_network = self.q_network.valid();
    }

    #[cfg(test)]
    fn target_q_values(&self, obs: &[f32]) -> Option<Vec<f32>> {
        if obs.len() != self.config.input_dim {
            return None;
        }
        let tensor = Tensor::<InferBackend, 1>::from_data(TensorData::from(obs), &self.device)
            .reshape([1, obs.len() as i32]);
        let q = self.target_network.forward(tensor);
        Some(q.into_data().to_vec().expect("f32 tensor data extraction"))
    }

    /// Record that a checkpoint was just persisted.
    pub fn mark_checkpoint(&mut self) {
        self.last_checkpoint_count = self.train_count;
    }

    /// One Double-DQN gradient update from the replay buffer. The caller must
    /// guarantee `replay.len() >= batch_size`.
    pub fn train_step(&mut self, replay: &mut ReplayBuffer) -> f32 {
        let batch = replay.sample(self.config.batch_size);
        let batch_size = batch.len();
        let input_dim = self.config.input_dim;

        let mut states = Vec::with_capacity(batch_size * input_dim);
        let mut next_states = Vec::with_capacity(batch_size * input_dim);
        for t in &batch {
            states.extend_from_slice(&t.state);
            match &t.next_state {
                Some(ns) => next_states.extend_from_slice(ns),
                // Missing next observation falls back to a zero vector, even
                // for non-terminal steps.
                None => next_states.extend(std::iter::repeat(0.0).take(input_dim)),
            }
        }

        // Q(s, a) on the training backend: forward all states, then pick the
        // recorded action per row via a one-hot mask.
        let state_tensor =
            Tensor::<TrainBackend, 1>::from_data(TensorData::from(states.as_slice()), &self.device)
                .reshape([batch_size as i32, input_dim as i32]);
        let q_all = self.q_network.forward(state_tensor);

        let mut mask_data = vec![0.0f32; batch_size * NUM_ACTIONS];
        for (i, t) in batch.iter().enumerate() {
            mask_data[i * NUM_ACTIONS + t.action] = 1.0;
        }
        let action_mask = Tensor::<TrainBackend, 1>::from_data(
            TensorData::from(mask_data.as_slice()),
            &self.device,
        )
        .reshape([batch_size as i32, NUM_ACTIONS as i32]);
        let q_taken = (q_all * action_mask).sum_dim(1); // [B, 1]
        let q_taken_data: Vec<f32> = q_taken
            .clone()
            .into_data()
            .to_vec()
            .expect("f32 tensor data extraction");

        // Double DQN targets: the online network picks the best next action,
        // the target network evaluates it.
        let next_tensor = Tensor::<InferBackend, 1>::from_data(
            TensorData::from(next_states.as_slice()),
            &self.device,
        )
        .reshape([batch_size as i32, input_dim as i32]);
        let next_online: Vec<f32> = self
            .q_network
            .valid()
            .forward(next_tensor.clone())
            .into_data()
            .to_vec()
            .expect("f32 tensor data extraction");
        let next_target: Vec<f32> = self
            .target_network
            .forward(next_tensor)
            .into_data()
            .to_vec()
            .expect("f32 tensor data extraction");

        let mut target_data = Vec::with_capacity(batch_size);
        for (i, t) in batch.iter().enumerate() {
            let row = &next_online[i * NUM_ACTIONS..(i + 1) * NUM_ACTIONS];
            let mut best_action = 0;
            let mut best_q = f32::NEG_INFINITY;
            for (a, &q) in row.iter().enumerate() {
                if q > best_q {
                    best_q = q;
                    best_action = a;
                }
            }
            let next_q = next_target[i * NUM_ACTIONS + best_action];
            let done = if t.done { 1.0 } else { 0.0 };
            target_data.push(t.reward + self.config.gamma * next_q * (1.0 - done));
        }
        let avg_target_q = target_data.iter().sum::<f32>() / batch_size as f32;
        let targets = Tensor::<TrainBackend, 1>::from_data(
            TensorData::from(target_data.as_slice()),
            &self.device,
        )
        .reshape([batch_size as i32, 1]);

        // Huber loss: quadratic within +/- delta of the target, linear beyond.
        let diff = q_taken - targets;
        let abs_diff = diff.abs();
        let quadratic = abs_diff.clone().clamp_max(HUBER_DELTA);
        let linear = abs_diff - quadratic.clone();
        let loss = (quadratic.clone() * quadratic * 0.5 + linear * HUBER_DELTA).mean();

        let loss_val: f32 = loss
            .clone()
            .into_data()
            .to_vec::<f32>()
            .expect("f32 loss tensor extraction")[0];

        let mut grads = loss.backward();
        // Clip the global gradient norm; the returned pre-clip norm feeds the
        // "not learning" diagnostic.
        let grad_norm = self
            .q_network
            .clip_grad_norm(&mut grads, self.config.max_grad_norm);
        let grads = GradientsParams::from_grads(grads, &self.q_network);

        let lr = self.scheduler.current_lr();
        self.q_network = self.optimizer.step(lr, self.q_network.clone(), grads);

        // Multiplicative exploration decay, floored at epsilon_min.
        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
        self.scheduler.step();
        self.train_count += 1;

        if self.train_count % GRAD_CHECK_INTERVAL == 0 && grad_norm < GRAD_NORM_FLOOR {
            warn!(grad_norm, "gradient too small, model may not be learning");
        }
        if self.train_count % LOG_INTERVAL == 0 {
            let avg_q = q_taken_data.iter().sum::<f32>() / batch_size as f32;
            info!(
                train_count = self.train_count,
                loss = loss_val,
                epsilon = self.epsilon,
                lr = self.scheduler.current_lr(),
                buffer = replay.len(),
                avg_q,
                avg_target_q,
                "training step"
            );
        }

        loss_val
    }

    /// Export the schedule/counter state persisted alongside the weights.
    pub fn training_state(&self, buffer_size: usize) -> TrainingState {
        TrainingState {
            epsilon: self.epsilon,
            train_count: self.train_count,
            buffer_size,
            learning_rate: self.scheduler.current_lr(),
            scheduler: self.scheduler.clone(),
        }
    }

    /// Restore counters and schedules from a checkpoint, applying the
    /// configured reset policies.
    pub fn restore_training_state(
        &mut self,
        state: &TrainingState,
        reset_learning_rate: bool,
        reset_exploration: bool,
    ) {
        if reset_learning_rate {
            // A rate decayed to near zero can no longer learn after a restart.
            let base = if state.learning_rate < self.config.lr_floor {
                info!(
                    restored = state.learning_rate,
                    restart = self.config.lr_restart,
                    "restored learning rate below floor, restarting"
                );
                self.config.lr_restart
            } else {
                state.learning_rate
            };
            self.scheduler =
                StepLrSchedule::new(base, self.config.lr_step_size, self.config.lr_gamma);
        } else {
            self.scheduler = state.scheduler.clone();
        }

        if reset_exploration {
            self.epsilon = self.config.epsilon_restart;
        } else {
            self.epsilon = state.epsilon.max(self.config.epsilon_min);
        }

        self.train_count = state.train_count;
        self.last_checkpoint_count = state.train_count;
    }

    /// Save network weights and optimizer state into a checkpoint directory.
    pub fn save_records(&self, dir: &Path) -> Result<(), CheckpointError> {
        let recorder = DefaultRecorder::default();
        self.q_network
            .clone()
            .valid()
            .save_file(dir.join("q_network"), &recorder)
            .map_err(|e| CheckpointError::ModelSave(e.to_string()))?;
        self.target_network
            .clone()
            .save_file(dir.join("target_network"), &recorder)
            .map_err(|e| CheckpointError::ModelSave(e.to_string()))?;
        recorder
            .record(self.optimizer.to_record(), dir.join("optimizer"))
            .map_err(|e| CheckpointError::ModelSave(e.to_string()))?;
        Ok(())
    }

    /// Load network weights and optimizer state from a checkpoint directory.
    /// All three records must load; a failure leaves the learner untouched.
    pub fn load_records(&mut self, dir: &Path) -> Result<(), CheckpointError> {
        let recorder = DefaultRecorder::default();
        let net_config = Self::network_config(&self.config);

        let q: QNetwork<TrainBackend> = net_config
            .init(&self.device)
            .load_file(dir.join("q_network"), &recorder, &self.device)
            .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;

        let target: QNetwork<InferBackend> = net_config
            .init(&self.device)
            .load_file(dir.join("target_network"), &recorder, &self.device)
            .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;

        let record: OptimizerRecord = recorder
            .load(dir.join("optimizer"), &self.device)
            .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;

        self.q_network = q;
        self.target_network = target;
        self.optimizer = Self::build_optimizer(&self.config).load_record(record);
        Ok(())
    }
}
