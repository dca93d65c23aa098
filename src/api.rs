//! JSON-over-HTTP surface of the decision service.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::error;

use crate::action::Action;
use crate::engine::{Engine, Episode, EpisodeStep};

/// All handlers serialize on the engine; decide/learn/persist never overlap.
pub type SharedEngine = Arc<Mutex<Engine>>;

#[derive(Debug, Deserialize)]
pub struct GetActionRequest {
    pub state: Vec<f32>,
    pub valid_actions: Vec<usize>,
}

#[derive(Debug, Serialize)]
pub struct GetActionResponse {
    pub action_idx: usize,
}

#[derive(Debug, Deserialize)]
pub struct GetDecisionRequest {
    pub obs: Vec<f32>,
    pub candidates: Vec<Action>,
}

#[derive(Debug, Deserialize)]
pub struct EpisodeStepPayload {
    pub state: Vec<f32>,
    pub operate: u8,
    pub tile: u8,
    pub reward: f32,
    #[serde(default)]
    pub next_state: Option<Vec<f32>>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReportEpisodeRequest {
    pub steps: Vec<EpisodeStepPayload>,
    #[serde(default)]
    pub is_hu: bool,
    #[serde(default)]
    pub hu_multi: f32,
    #[serde(default)]
    pub shaped_reward: f32,
}

impl ReportEpisodeRequest {
    fn into_episode(self) -> Episode {
        Episode {
            steps: self
                .steps
                .into_iter()
                .map(|s| EpisodeStep {
                    state: s.state,
                    action: Action {
                        operate: s.operate,
                        tile: s.tile,
                    },
                    reward: s.reward,
                    next_state: s.next_state,
                    done: s.done,
                })
                .collect(),
            is_hu: self.is_hu,
            hu_multi: self.hu_multi,
            shaped_reward: self.shaped_reward,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub approximator_available: bool,
    pub buffer_size: usize,
    pub epsilon: f32,
    pub train_count: usize,
}

pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/get_action", post(get_action))
        .route("/get_decision", post(get_decision))
        .route("/report_episode", post(report_episode))
        .route("/save_model", post(save_model))
        .route("/health", get(health))
        .with_state(engine)
}

async fn get_action(
    State(engine): State<SharedEngine>,
    Json(req): Json<GetActionRequest>,
) -> Json<GetActionResponse> {
    let mut engine = engine.lock().await;
    let action_idx = engine.select_action(&req.state, &req.valid_actions);
    Json(GetActionResponse { action_idx })
}

async fn get_decision(
    State(engine): State<SharedEngine>,
    Json(req): Json<GetDecisionRequest>,
) -> Json<Action> {
    let mut engine = engine.lock().await;
    Json(engine.decide(&req.obs, &req.candidates))
}

async fn report_episode(
    State(engine): State<SharedEngine>,
    Json(req): Json<ReportEpisodeRequest>,
) -> Json<StatusResponse> {
    let mut engine = engine.lock().await;
    engine.report_episode(req.into_episode());
    Json(StatusResponse { status: "ok" })
}

async fn save_model(
    State(engine): State<SharedEngine>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let engine = engine.lock().await;
    match engine.save_model() {
        Ok(()) => Ok(Json(StatusResponse { status: "saved" })),
        Err(e) => {
            error!(error = %e, "manual save failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn health(State(engine): State<SharedEngine>) -> Json<HealthResponse> {
    let engine = engine.lock().await;
    let health = engine.health();
    Json(HealthResponse {
        status: "healthy",
        approximator_available: health.approximator_available,
        buffer_size: health.buffer_size,
        epsilon: health.epsilon,
        train_count: health.train_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::DqnConfig;
    use crate::config::{AppConfig, CheckpointConfig};

    fn shared_engine() -> (SharedEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            dqn: DqnConfig {
                input_dim: 8,
                hidden_dim: 16,
                batch_size: 4,
                replay_capacity: 64,
                ..Default::default()
            },
            checkpoint: CheckpointConfig {
                path: dir.path().join("model"),
                ..Default::default()
            },
            ..Default::default()
        };
        (Arc::new(Mutex::new(Engine::new(config))), dir)
    }

    #[tokio::test]
    async fn test_get_decision_empty_candidates_is_pass() {
        let (engine, _dir) = shared_engine();
        let req = GetDecisionRequest {
            obs: vec![0.0; 8],
            candidates: vec![],
        };
        let Json(action) = get_decision(State(engine), Json(req)).await;
        assert_eq!(action, Action::pass());
    }

    #[tokio::test]
    async fn test_get_action_within_valid_set() {
        let (engine, _dir) = shared_engine();
        let req = GetActionRequest {
            state: vec![0.1; 8],
            valid_actions: vec![2, 40, 136],
        };
        let Json(resp) = get_action(State(engine), Json(req)).await;
        assert!([2, 40, 136].contains(&resp.action_idx));
    }

    #[tokio::test]
    async fn test_report_episode_fills_buffer() {
        let (engine, _dir) = shared_engine();
        let req = ReportEpisodeRequest {
            steps: vec![
                EpisodeStepPayload {
                    state: vec![0.5; 8],
                    operate: 64,
                    tile: 3,
                    reward: 0.1,
                    next_state: Some(vec![0.5; 8]),
                    done: false,
                },
                EpisodeStepPayload {
                    state: vec![0.5; 8],
                    operate: 1,
                    tile: 0,
                    reward: 1.0,
                    next_state: None,
                    done: true,
                },
            ],
            is_hu: true,
            hu_multi: 2.0,
            shaped_reward: 1.5,
        };
        let Json(resp) = report_episode(State(engine.clone()), Json(req)).await;
        assert_eq!(resp.status, "ok");

        let Json(health) = health(State(engine)).await;
        assert_eq!(health.buffer_size, 2);
        assert!(health.approximator_available);
    }

    #[tokio::test]
    async fn test_save_model_endpoint() {
        let (engine, _dir) = shared_engine();
        let resp = save_model(State(engine)).await;
        let Json(status) = resp.expect("save should succeed");
        assert_eq!(status.status, "saved");
    }

    #[test]
    fn test_request_wire_shapes() {
        let req: GetDecisionRequest = serde_json::from_str(
            r#"{"obs": [0.0, 1.0], "candidates": [{"operate": 64, "tile": 5}, {"operate": 1, "tile": 0}]}"#,
        )
        .unwrap();
        assert_eq!(req.candidates.len(), 2);
        assert_eq!(req.candidates[0], Action { operate: 64, tile: 5 });

        let action = Action { operate: 32, tile: 8 };
        assert_eq!(
            serde_json::to_string(&action).unwrap(),
            r#"{"operate":32,"tile":8}"#
        );
    }
}
