//! Picks the step a work item moves to next.

use crate::pipeline::PipelineStatus;

/// Next step to run, or `None` when the step just finished was the last.
pub fn get_next_step_name(status: &PipelineStatus) -> Option<&str> {
    status.remaining_steps.first().map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(active: &str, remaining: &[&str], completed: &[&str]) -> PipelineStatus {
        PipelineStatus {
            active_step: Some(active.into()),
            remaining_steps: remaining.iter().map(|s| s.to_string()).collect(),
            completed_steps: completed.iter().map(|s| s.to_string()).collect(),
            ..PipelineStatus::default()
        }
    }

    #[test]
    fn returns_head_of_remaining() {
        let s = status("validate", &["transform", "complete"], &["extract"]);
        assert_eq!(get_next_step_name(&s), Some("transform"));
    }

    #[test]
    fn none_after_last_step() {
        let s = status("step3", &[], &["step1", "step2"]);
        assert_eq!(get_next_step_name(&s), None);
    }
}
