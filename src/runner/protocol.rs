use super::ExecutionResult;

pub const OUTPUT_START_MARKER: &str = "---GROUPCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---GROUPCLAW_OUTPUT_END---";
const DIAGNOSTIC_TAIL_CHARS: usize = 500;

/// Extracts the result framed between the sentinel lines. Anything else on
/// stdout is debug noise. A missing frame or invalid JSON becomes an error
/// result carrying the output tail.
pub fn parse_framed_output(stdout: &str) -> ExecutionResult {
    let Some(start) = stdout.rfind(OUTPUT_START_MARKER) else {
        return ExecutionResult::error(format!(
            "worker output has no result frame; output tail: {}",
            tail(stdout)
        ));
    };
    let body_start = start + OUTPUT_START_MARKER.len();
    let Some(end_rel) = stdout[body_start..].find(OUTPUT_END_MARKER) else {
        return ExecutionResult::error(format!(
            "worker result frame is not terminated; output tail: {}",
            tail(stdout)
        ));
    };
    let body = stdout[body_start..body_start + end_rel].trim();
    match serde_json::from_str::<ExecutionResult>(body) {
        Ok(result) => result,
        Err(err) => ExecutionResult::error(format!(
            "worker result frame is not valid json ({err}); output tail: {}",
            tail(stdout)
        )),
    }
}

pub fn frame_result(result: &ExecutionResult) -> Result<String, serde_json::Error> {
    let body = serde_json::to_string(result)?;
    Ok(format!("{OUTPUT_START_MARKER}\n{body}\n{OUTPUT_END_MARKER}\n"))
}

pub(crate) fn tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= DIAGNOSTIC_TAIL_CHARS {
        return text.trim().to_string();
    }
    text.chars()
        .skip(count - DIAGNOSTIC_TAIL_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ResultStatus;

    #[test]
    fn frame_is_extracted_from_noisy_stdout() {
        let stdout = format!(
            "booting agent\n{{\"not\":\"the result\"}}\n{}",
            frame_result(&ExecutionResult::success_message("hi")).expect("frame")
        );
        let parsed = parse_framed_output(&stdout);
        assert_eq!(parsed.status, ResultStatus::Success);
        assert_eq!(parsed.deliverable_message(), Some("hi"));
    }

    #[test]
    fn missing_or_broken_frames_become_error_results_with_tail() {
        let none = parse_framed_output("just logs\n");
        assert_eq!(none.status, ResultStatus::Error);
        assert!(none.error.as_deref().unwrap_or_default().contains("just logs"));

        let unterminated = parse_framed_output(&format!("{OUTPUT_START_MARKER}\n{{}}"));
        assert!(unterminated
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("not terminated"));

        let garbage =
            parse_framed_output(&format!("{OUTPUT_START_MARKER}\nnope\n{OUTPUT_END_MARKER}\n"));
        assert_eq!(garbage.status, ResultStatus::Error);
        assert!(garbage
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("not valid json"));
    }

    #[test]
    fn tail_keeps_only_the_end_of_long_output() {
        let long = format!("{}END", "x".repeat(2_000));
        let t = tail(&long);
        assert_eq!(t.chars().count(), 500);
        assert!(t.ends_with("END"));
    }
}
