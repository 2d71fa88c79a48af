//! Testing utilities for campaign pipelines.
//!
//! This module provides:
//! - Derivation engine doubles
//! - A controller harness with sample stage inputs
//! - Assertions over stage state

mod assertions;
mod engines;
mod fixtures;

pub use assertions::{assert_current_stage, assert_invariants, assert_status, assert_statuses};
pub use engines::{EchoEngine, ScriptedEngine, SlowEngine, StalledEngine};
pub use fixtures::{sample_input, ControllerHarness};
