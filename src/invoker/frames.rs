use crate::domain::AgentOutput;

/// Literal marker lines the worker prints around each structured frame.
pub const OUTPUT_START_MARKER: &str = "---CORECLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---CORECLAW_OUTPUT_END---";

/// Incremental scanner over worker stdout lines. Content outside markers is
/// diagnostic and ignored; malformed JSON or an invalid shape between markers
/// skips the frame silently. The last valid frame is canonical.
#[derive(Debug, Default)]
pub struct FrameScanner {
    in_frame: bool,
    buffer: String,
    last_valid: Option<AgentOutput>,
    valid_frames: usize,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line (without trailing newline). Returns true when the
    /// line completed a new valid frame, which callers use to reset timeouts.
    pub fn push_line(&mut self, line: &str) -> bool {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim() == OUTPUT_START_MARKER {
            self.in_frame = true;
            self.buffer.clear();
            return false;
        }
        if trimmed.trim() == OUTPUT_END_MARKER {
            if !self.in_frame {
                return false;
            }
            self.in_frame = false;
            match serde_json::from_str::<AgentOutput>(&self.buffer) {
                Ok(output) if !output.summary.trim().is_empty() => {
                    self.last_valid = Some(output);
                    self.valid_frames += 1;
                    return true;
                }
                _ => return false,
            }
        }
        if self.in_frame {
            self.buffer.push_str(trimmed);
            self.buffer.push('\n');
        }
        false
    }

    pub fn last_valid(&self) -> Option<&AgentOutput> {
        self.last_valid.as_ref()
    }

    pub fn valid_frames(&self) -> usize {
        self.valid_frames
    }

    pub fn into_last_valid(self) -> Option<AgentOutput> {
        self.last_valid
    }
}

/// Parse a complete captured stdout in one pass.
pub fn parse_stdout(stdout: &str) -> Option<AgentOutput> {
    let mut scanner = FrameScanner::new();
    for line in stdout.lines() {
        scanner.push_line(line);
    }
    scanner.into_last_valid()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentOutputStatus;

    fn frame(summary: &str) -> String {
        format!(
            "{OUTPUT_START_MARKER}\n{{\"status\":\"completed\",\"priority\":\"normal\",\"summary\":\"{summary}\",\"needsReview\":false,\"outputs\":[],\"metadata\":{{}}}}\n{OUTPUT_END_MARKER}\n"
        )
    }

    #[test]
    fn single_frame_with_surrounding_diagnostics_parses() {
        let stdout = format!("debug\n{}", frame("ok"));
        let output = parse_stdout(&stdout).expect("frame");
        assert_eq!(output.status, AgentOutputStatus::Completed);
        assert_eq!(output.summary, "ok");
    }

    #[test]
    fn last_valid_frame_wins() {
        let stdout = format!("{}{}", frame("first"), frame("second"));
        let output = parse_stdout(&stdout).expect("frame");
        assert_eq!(output.summary, "second");
    }

    #[test]
    fn invalid_second_frame_falls_back_to_first() {
        let stdout = format!(
            "{}{OUTPUT_START_MARKER}\nnot json at all\n{OUTPUT_END_MARKER}\n",
            frame("first")
        );
        let output = parse_stdout(&stdout).expect("frame");
        assert_eq!(output.summary, "first");
    }

    #[test]
    fn frame_with_wrong_shape_is_skipped() {
        let stdout = format!(
            "{OUTPUT_START_MARKER}\n{{\"status\":\"nonsense\",\"summary\":\"x\"}}\n{OUTPUT_END_MARKER}\n"
        );
        assert!(parse_stdout(&stdout).is_none());
    }

    #[test]
    fn frame_with_empty_summary_is_skipped() {
        let stdout = format!(
            "{OUTPUT_START_MARKER}\n{{\"status\":\"completed\",\"summary\":\"  \"}}\n{OUTPUT_END_MARKER}\n"
        );
        assert!(parse_stdout(&stdout).is_none());
    }

    #[test]
    fn end_marker_without_start_is_diagnostic_noise() {
        let stdout = format!("{OUTPUT_END_MARKER}\n{}", frame("ok"));
        let output = parse_stdout(&stdout).expect("frame");
        assert_eq!(output.summary, "ok");
    }

    #[test]
    fn multi_line_json_between_markers_parses() {
        let stdout = format!(
            "{OUTPUT_START_MARKER}\n{{\n  \"status\": \"partial\",\n  \"summary\": \"half done\"\n}}\n{OUTPUT_END_MARKER}\n"
        );
        let output = parse_stdout(&stdout).expect("frame");
        assert_eq!(output.status, AgentOutputStatus::Partial);
    }

    #[test]
    fn scanner_reports_frame_completion_incrementally() {
        let mut scanner = FrameScanner::new();
        assert!(!scanner.push_line("noise"));
        assert!(!scanner.push_line(OUTPUT_START_MARKER));
        assert!(!scanner.push_line(r#"{"status":"completed","summary":"done"}"#));
        assert!(scanner.push_line(OUTPUT_END_MARKER));
        assert_eq!(scanner.valid_frames(), 1);
        assert_eq!(scanner.last_valid().expect("output").summary, "done");
    }
}
