//! # Mahjong AI
//!
//! An online reinforcement-learning decision service for a turn-based
//! mahjong-style tile game. A Double DQN with a dueling Q-network answers
//! move decisions over JSON HTTP and learns continuously from reported
//! episodes via the Burn ML framework.
//!
//! ## Modules
//!
//! - [`action`] — Flat action codec: (operate, tile) pairs to action indices
//! - [`ai`] — Dueling Q-network and the Double-DQN learner
//! - [`replay`] — Ring-buffer experience replay with uniform sampling
//! - [`engine`] — Decision engine: epsilon-greedy decide, episode ingestion
//! - [`checkpoint`] — Model persistence with timestamped backups
//! - [`api`] — Axum handlers and wire types
//! - [`config`] — TOML configuration loading and validation
//! - [`error`] — Structured error types

#![recursion_limit = "256"]

pub mod action;
pub mod ai;
pub mod api;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod replay;
