//! Value-function approximation: the dueling Q-network and the Double-DQN
//! learner that trains it.

pub mod dqn;
pub mod network;

pub use dqn::{DqnConfig, DqnLearner, InferBackend, StepLrSchedule, TrainBackend};
pub use network::{QNetwork, QNetworkConfig};
