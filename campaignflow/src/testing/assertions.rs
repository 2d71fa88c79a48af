//! Assertions over controller state.

use crate::core::StageStatus;
use crate::pipeline::PipelineController;

/// Asserts that a stage has the expected status.
pub fn assert_status(controller: &PipelineController, stage_id: &str, expected: StageStatus) {
    let actual = controller.status(stage_id);
    assert_eq!(
        actual,
        Ok(expected),
        "Expected stage '{stage_id}' to be {expected}, got {actual:?}"
    );
}

/// Asserts that every listed stage has the expected status.
pub fn assert_statuses(controller: &PipelineController, stage_ids: &[&str], expected: StageStatus) {
    for stage_id in stage_ids {
        assert_status(controller, stage_id, expected);
    }
}

/// Asserts that the controller's records are internally consistent.
pub fn assert_invariants(controller: &PipelineController) {
    if let Err(violation) = controller.check_invariants() {
        panic!("Invariant violated: {violation}");
    }
}

/// Asserts the id of the current stage.
pub fn assert_current_stage(controller: &PipelineController, expected: Option<&str>) {
    assert_eq!(
        controller.current_stage_id(),
        expected,
        "Unexpected current stage"
    );
}
