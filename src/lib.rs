//! # swarmctl: coordination and control plane for multi-agent execution
//!
//! `swarmctl` is the in-process coordination runtime shared by every session
//! of a multi-agent code-execution platform. Independent sessions spawn
//! hierarchies of worker agents to decompose and execute tasks; this crate
//! keeps those hierarchies consistent, delegates work, enforces external API
//! rate limits, and exposes observable state to a monitoring dashboard.
//!
//! ## Core components
//!
//! - [`hierarchy`] — agent/delegation graph with depth and fan-out limits
//! - [`state_machine`] — per-agent lifecycle FSM with optimistic concurrency
//! - [`task_manager`] — task tree, decomposition, cascade, integrity repair
//! - [`complexity`] — weighted complexity scoring over a task
//! - [`delegation`] — scores a task against an agent and decides to delegate
//! - [`session_registry`] — cross-session directory with roll-up metrics
//! - [`coordination_db`] — shared file locks, change journal, conflicts
//! - [`rate_limit`] — rolling request/token windows against plan ceilings
//! - [`hook_metrics`] — per-hook success/failure/duration histograms
//! - [`feature_flags`] — boolean gates with environment/runtime overrides
//! - [`plan_evaluator`] — scores and ranks competing plans
//! - [`dashboard`] — aggregated snapshot and event timeline
//! - [`context_retriever`] — two-layer progressive context retrieval
//! - [`control_plane`] — composition root wiring the above together
//!
//! ## Quick start
//!
//! ```
//! use swarmctl::config::ControlPlaneConfig;
//! use swarmctl::control_plane::ControlPlane;
//!
//! let plane = ControlPlane::new(ControlPlaneConfig::default());
//! plane.hierarchy.register_hierarchy(None, "root-agent", None).unwrap();
//! ```
//!
//! Every core service publishes through one shared [`event_bus::EventHub`],
//! so a listener (the Dashboard Manager, an external log streamer) subscribes
//! once and observes every component without polling.

pub mod complexity;
pub mod config;
pub mod context_retriever;
pub mod control_plane;
pub mod coordination_db;
pub mod dashboard;
pub mod delegation;
pub mod event_bus;
pub mod feature_flags;
pub mod hierarchy;
pub mod hook_metrics;
pub mod plan_evaluator;
pub mod rate_limit;
pub mod session_registry;
pub mod state_machine;
pub mod task_manager;
pub mod telemetry;
