use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::action::{Action, Operate};
use crate::ai::DqnLearner;
use crate::checkpoint::CheckpointStore;
use crate::config::AppConfig;
use crate::error::CheckpointError;
use crate::replay::{ReplayBuffer, Transition};

/// One step of a finished episode, already decoded from the wire.
#[derive(Debug, Clone)]
pub struct EpisodeStep {
    pub state: Vec<f32>,
    pub action: Action,
    pub reward: f32,
    pub next_state: Option<Vec<f32>>,
    pub done: bool,
}

/// A finished episode as reported by the game server. The outcome fields are
/// informational; rewards arrive pre-shaped per step.
#[derive(Debug, Clone, Default)]
pub struct Episode {
    pub steps: Vec<EpisodeStep>,
    pub is_hu: bool,
    pub hu_multi: f32,
    pub shaped_reward: f32,
}

/// Snapshot of the engine's learning state for the health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Health {
    pub approximator_available: bool,
    pub buffer_size: usize,
    pub epsilon: f32,
    pub train_count: usize,
}

enum Policy {
    Learned(Box<DqnLearner>),
    Random,
}

/// The decision engine: owns the policy, the replay buffer, and the
/// checkpoint store, and serializes all decide/learn/persist operations.
pub struct Engine {
    config: AppConfig,
    replay: ReplayBuffer,
    policy: Policy,
    checkpoints: CheckpointStore,
    rng: StdRng,
}

impl Engine {
    /// Build an engine from config, restoring the default checkpoint when one
    /// exists. Checkpoint problems never abort startup: the engine falls back
    /// to freshly initialized state.
    pub fn new(config: AppConfig) -> Self {
        let replay = ReplayBuffer::new(config.dqn.replay_capacity);
        let checkpoints = CheckpointStore::new(config.checkpoint.clone());

        let policy = if config.dqn.enabled {
            let mut learner = Box::new(DqnLearner::new(config.dqn.clone()));
            let path = checkpoints.path().to_path_buf();
            if path.exists() {
                match checkpoints.load(
                    &mut learner,
                    &path,
                    config.checkpoint.reset_learning_rate,
                    config.checkpoint.reset_exploration,
                ) {
                    Ok(()) => info!(path = %path.display(), "restored checkpoint"),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "checkpoint restore failed, starting fresh")
                    }
                }
            } else {
                info!(path = %path.display(), "no checkpoint found, starting fresh");
            }
            Policy::Learned(learner)
        } else {
            info!("learning disabled, using uniform random policy");
            Policy::Random
        };

        Engine {
            config,
            replay,
            policy,
            checkpoints,
            rng: StdRng::from_os_rng(),
        }
    }

    fn epsilon(&self) -> f32 {
        match &self.policy {
            Policy::Learned(learner) => learner.epsilon(),
            Policy::Random => self.config.dqn.epsilon_start,
        }
    }

    fn train_count(&self) -> usize {
        match &self.policy {
            Policy::Learned(learner) => learner.train_count(),
            Policy::Random => 0,
        }
    }

    /// Pick one of the candidate actions for the given observation.
    ///
    /// Epsilon-greedy: with probability epsilon (or whenever greedy
    /// evaluation is impossible) a uniformly random candidate is returned.
    /// Otherwise the candidate with the highest Q-value wins; candidates the
    /// codec cannot index are skipped during the greedy scan but stay eligible
    /// for the random fallback. An empty candidate list means pass.
    pub fn decide(&mut self, obs: &[f32], candidates: &[Action]) -> Action {
        if candidates.is_empty() {
            return Action::pass();
        }
        for c in candidates {
            if c.operate == Operate::Pass.code() && c.tile != 0 {
                warn!(tile = c.tile, "pass candidate carries a tile");
            }
        }

        let explore = self.rng.random_range(0.0..1.0) < self.epsilon();
        if !explore {
            if let Policy::Learned(learner) = &self.policy {
                if let Some(q) = learner.q_values(obs) {
                    let mut best: Option<Action> = None;
                    let mut best_q = f32::NEG_INFINITY;
                    for c in candidates {
                        let Some(index) = c.index() else { continue };
                        if q[index] > best_q {
                            best_q = q[index];
                            best = Some(*c);
                        }
                    }
                    if let Some(action) = best {
                        return action.normalized();
                    }
                    warn!("no candidate was encodable, falling back to random choice");
                }
            }
        }

        let pick = candidates[self.rng.random_range(0..candidates.len())];
        pick.normalized()
    }

    /// Flat-index variant of [`decide`](Engine::decide) for callers that work
    /// in action-index space. An empty list yields index 0; indices outside
    /// the Q-vector are skipped during the greedy scan.
    pub fn select_action(&mut self, state: &[f32], valid_actions: &[usize]) -> usize {
        if valid_actions.is_empty() {
            return 0;
        }

        let explore = self.rng.random_range(0.0..1.0) < self.epsilon();
        if !explore {
            if let Policy::Learned(learner) = &self.policy {
                if let Some(q) = learner.q_values(state) {
                    let mut best: Option<usize> = None;
                    let mut best_q = f32::NEG_INFINITY;
                    for &index in valid_actions {
                        if index < q.len() && q[index] > best_q {
                            best_q = q[index];
                            best = Some(index);
                        }
                    }
                    if let Some(index) = best {
                        return index;
                    }
                }
            }
        }

        valid_actions[self.rng.random_range(0..valid_actions.len())]
    }

    /// Ingest a finished episode: store its encodable steps in the replay
    /// buffer, then run at most one training step when enough samples exist.
    /// Returns the training loss when a step ran.
    pub fn report_episode(&mut self, episode: Episode) -> Option<f32> {
        let reported = episode.steps.len();
        let mut stored = 0;
        for step in episode.steps {
            let Some(action) = step.action.index() else {
                // Unencodable actions carry no learnable signal.
                continue;
            };
            if step.state.len() != self.config.dqn.input_dim {
                warn!(
                    expected = self.config.dqn.input_dim,
                    got = step.state.len(),
                    "dropping step with malformed state vector"
                );
                continue;
            }
            let next_state = match step.next_state {
                Some(ns) if ns.len() == self.config.dqn.input_dim => Some(ns),
                Some(ns) => {
                    warn!(
                        expected = self.config.dqn.input_dim,
                        got = ns.len(),
                        "dropping malformed next state vector"
                    );
                    None
                }
                None => None,
            };
            self.replay.push(Transition {
                state: step.state,
                action,
                reward: step.reward,
                next_state,
                done: step.done,
            });
            stored += 1;
        }

        let mut loss = None;
        if let Policy::Learned(learner) = &mut self.policy {
            if self.replay.len() >= learner.config().batch_size {
                loss = Some(learner.train_step(&mut self.replay));
                if learner.train_count() % self.config.dqn.update_target_every == 0 {
                    learner.sync_target();
                    info!(
                        train_count = learner.train_count(),
                        "synchronized target network"
                    );
                }
            }

            // Periodic autosave with a timestamped backup. Failures here are
            // logged and the service keeps running.
            if learner.train_count() - learner.last_checkpoint_count()
                >= self.config.dqn.save_every
            {
                let default_path = self.checkpoints.path().to_path_buf();
                let backup_path = self.checkpoints.backup_path();
                let buffer_size = self.replay.len();
                for path in [&default_path, &backup_path] {
                    if let Err(e) = self.checkpoints.save(learner, buffer_size, path) {
                        warn!(path = %path.display(), error = %e, "autosave failed");
                    }
                }
                learner.mark_checkpoint();
            }
        }

        info!(
            reported,
            stored,
            buffer = self.replay.len(),
            train_count = self.train_count(),
            is_hu = episode.is_hu,
            hu_multi = episode.hu_multi,
            shaped_reward = episode.shaped_reward,
            "episode ingested"
        );
        loss
    }

    /// Persist the current model to the default checkpoint path. A no-op when
    /// the engine runs the random policy.
    pub fn save_model(&self) -> Result<(), CheckpointError> {
        match &self.policy {
            Policy::Learned(learner) => {
                let path = self.checkpoints.path().to_path_buf();
                self.checkpoints.save(learner, self.replay.len(), &path)
            }
            Policy::Random => {
                info!("no approximator to save");
                Ok(())
            }
        }
    }

    pub fn health(&self) -> Health {
        Health {
            approximator_available: matches!(self.policy, Policy::Learned(_)),
            buffer_size: self.replay.len(),
            epsilon: self.epsilon(),
            train_count: self.train_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::DqnConfig;
    use crate::config::CheckpointConfig;

    fn test_config(enabled: bool, epsilon_start: f32) -> (AppConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            dqn: DqnConfig {
                enabled,
                input_dim: 8,
                hidden_dim: 16,
                batch_size: 4,
                replay_capacity: 64,
                epsilon_start,
                ..Default::default()
            },
            checkpoint: CheckpointConfig {
                path: dir.path().join("model"),
                ..Default::default()
            },
            ..Default::default()
        };
        (config, dir)
    }

    fn episode(steps: Vec<EpisodeStep>) -> Episode {
        Episode {
            steps,
            ..Default::default()
        }
    }

    fn step(operate: u8, tile: u8, state_len: usize) -> EpisodeStep {
        EpisodeStep {
            state: vec![0.5; state_len],
            action: Action { operate, tile },
            reward: 1.0,
            next_state: Some(vec![0.25; state_len]),
            done: false,
        }
    }

    #[test]
    fn test_decide_empty_candidates_is_pass() {
        let (config, _dir) = test_config(true, 0.0);
        let mut engine = Engine::new(config);
        assert_eq!(engine.decide(&[0.0; 8], &[]), Action::pass());
    }

    #[test]
    fn test_decide_greedy_returns_supplied_candidate() {
        let (config, _dir) = test_config(true, 0.0);
        let mut engine = Engine::new(config);
        let candidates = [
            Action {
                operate: 64,
                tile: 3,
            },
            Action {
                operate: 32,
                tile: 3,
            },
            Action::pass(),
        ];
        for _ in 0..5 {
            let picked = engine.decide(&[0.5; 8], &candidates);
            assert!(candidates.contains(&picked));
        }
    }

    #[test]
    fn test_decide_normalizes_malformed_pass() {
        // Only one candidate, so both branches must return it, normalized.
        let (config, _dir) = test_config(true, 0.0);
        let mut engine = Engine::new(config);
        let picked = engine.decide(&[0.0; 8], &[Action { operate: 1, tile: 9 }]);
        assert_eq!(picked, Action::pass());
    }

    #[test]
    fn test_decide_unencodable_candidates_fall_back_to_random() {
        let (config, _dir) = test_config(true, 0.0);
        let mut engine = Engine::new(config);
        let unknown = Action {
            operate: 2,
            tile: 60,
        };
        assert_eq!(engine.decide(&[0.0; 8], &[unknown]), unknown);
    }

    #[test]
    fn test_select_action_empty_list() {
        let (config, _dir) = test_config(true, 0.0);
        let mut engine = Engine::new(config);
        assert_eq!(engine.select_action(&[0.0; 8], &[]), 0);
    }

    #[test]
    fn test_select_action_stays_within_valid_set() {
        let (config, _dir) = test_config(true, 0.0);
        let mut engine = Engine::new(config);
        let valid = [3, 17, 136];
        for _ in 0..5 {
            assert!(valid.contains(&engine.select_action(&[0.1; 8], &valid)));
        }
    }

    #[test]
    fn test_report_episode_below_batch_size_does_not_train() {
        let (config, _dir) = test_config(true, 1.0);
        let mut engine = Engine::new(config);
        let loss = engine.report_episode(episode(vec![
            step(64, 0, 8),
            step(64, 1, 8),
            step(1, 0, 8),
        ]));
        assert!(loss.is_none());
        assert_eq!(engine.health().buffer_size, 3);
        assert_eq!(engine.health().train_count, 0);
    }

    #[test]
    fn test_report_episode_trains_once_when_buffer_full_enough() {
        let (config, _dir) = test_config(true, 1.0);
        let mut engine = Engine::new(config);
        let steps: Vec<EpisodeStep> = (0..6).map(|i| step(64, i as u8, 8)).collect();
        let loss = engine.report_episode(episode(steps));
        assert!(loss.is_some());
        assert_eq!(engine.health().train_count, 1);
    }

    #[test]
    fn test_report_episode_skips_unencodable_and_malformed_steps() {
        let (config, _dir) = test_config(true, 1.0);
        let mut engine = Engine::new(config);
        engine.report_episode(episode(vec![
            step(64, 0, 8),
            step(2, 0, 8),   // unknown operate code
            step(64, 99, 8), // out-of-range tile
            step(64, 1, 5),  // wrong state length
        ]));
        assert_eq!(engine.health().buffer_size, 1);
    }

    #[test]
    fn test_target_sync_runs_at_configured_interval() {
        let (mut config, _dir) = test_config(true, 1.0);
        config.dqn.update_target_every = 1;
        let mut engine = Engine::new(config);

        // Every training step lands on the sync interval; decisions must stay
        // well-formed afterwards.
        for _ in 0..3 {
            let steps: Vec<EpisodeStep> = (0..6).map(|i| step(64, i as u8, 8)).collect();
            engine.report_episode(episode(steps));
        }
        assert_eq!(engine.health().train_count, 3);

        let picked = engine.decide(&[0.1; 8], &[Action::pass()]);
        assert_eq!(picked, Action::pass());
    }

    #[test]
    fn test_autosave_writes_default_checkpoint_and_backup() {
        let (mut config, _dir) = test_config(true, 1.0);
        config.dqn.save_every = 1;
        let checkpoint_path = config.checkpoint.path.clone();
        let mut engine = Engine::new(config);

        let steps: Vec<EpisodeStep> = (0..6).map(|i| step(64, i as u8, 8)).collect();
        engine.report_episode(episode(steps));

        assert!(checkpoint_path.join("training_state.json").exists());
        // One timestamped backup next to the default checkpoint.
        let parent = checkpoint_path.parent().unwrap();
        let backups = std::fs::read_dir(parent)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with("model_")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn test_random_policy_health_and_save() {
        let (config, _dir) = test_config(false, 1.0);
        let mut engine = Engine::new(config);
        let health = engine.health();
        assert!(!health.approximator_available);
        assert_eq!(health.train_count, 0);

        // Random policy still answers decisions and saves are no-ops.
        let picked = engine.decide(&[0.0; 8], &[Action::pass()]);
        assert_eq!(picked, Action::pass());
        engine.save_model().unwrap();
    }
}
