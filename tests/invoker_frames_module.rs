use coreclaw::domain::AgentOutputStatus;
use coreclaw::invoker::{parse_stdout, FrameScanner, OUTPUT_END_MARKER, OUTPUT_START_MARKER};

const VALID_FRAME_JSON: &str = r#"{"status":"completed","priority":"normal","summary":"ok","needsReview":false,"outputs":[],"metadata":{}}"#;

// The literal stdout from the specification of the sentinel protocol.
#[test]
fn sentinel_parse_of_the_reference_stdout() {
    let stdout =
        format!("debug\n{OUTPUT_START_MARKER}\n{VALID_FRAME_JSON}\n{OUTPUT_END_MARKER}\n");
    let output = parse_stdout(&stdout).expect("frame");
    assert_eq!(output.status, AgentOutputStatus::Completed);
    assert_eq!(output.summary, "ok");
    assert!(!output.needs_review);
    assert!(output.outputs.is_empty());
}

#[test]
fn two_valid_frames_make_the_second_canonical() {
    let f1 = format!(
        "{OUTPUT_START_MARKER}\n{}\n{OUTPUT_END_MARKER}\n",
        VALID_FRAME_JSON.replace("\"ok\"", "\"first\"")
    );
    let f2 = format!(
        "{OUTPUT_START_MARKER}\n{}\n{OUTPUT_END_MARKER}\n",
        VALID_FRAME_JSON.replace("\"ok\"", "\"second\"")
    );
    let output = parse_stdout(&format!("{f1}{f2}")).expect("frame");
    assert_eq!(output.summary, "second");
}

#[test]
fn invalid_second_frame_keeps_the_first_canonical() {
    let f1 = format!(
        "{OUTPUT_START_MARKER}\n{}\n{OUTPUT_END_MARKER}\n",
        VALID_FRAME_JSON.replace("\"ok\"", "\"first\"")
    );
    let broken = format!("{OUTPUT_START_MARKER}\n{{not json\n{OUTPUT_END_MARKER}\n");
    let output = parse_stdout(&format!("{f1}{broken}")).expect("frame");
    assert_eq!(output.summary, "first");
}

#[test]
fn marker_lines_are_bit_exact() {
    assert_eq!(OUTPUT_START_MARKER, "---CORECLAW_OUTPUT_START---");
    assert_eq!(OUTPUT_END_MARKER, "---CORECLAW_OUTPUT_END---");

    // A near-miss marker is diagnostic text, not a frame boundary.
    let stdout = format!("--CORECLAW_OUTPUT_START--\n{VALID_FRAME_JSON}\n");
    assert!(parse_stdout(&stdout).is_none());
}

#[test]
fn content_outside_markers_is_ignored_entirely() {
    let stdout = format!(
        "random log line\n{{\"status\":\"failed\"}}\n{OUTPUT_START_MARKER}\n{VALID_FRAME_JSON}\n{OUTPUT_END_MARKER}\ntrailing noise\n"
    );
    let output = parse_stdout(&stdout).expect("frame");
    assert_eq!(output.summary, "ok");
}

#[test]
fn incremental_feed_resets_nothing_between_frames() {
    let mut scanner = FrameScanner::new();
    for line in [
        "noise",
        OUTPUT_START_MARKER,
        VALID_FRAME_JSON,
        OUTPUT_END_MARKER,
        OUTPUT_START_MARKER,
        "garbage that is not json",
        OUTPUT_END_MARKER,
    ] {
        scanner.push_line(line);
    }
    assert_eq!(scanner.valid_frames(), 1);
    assert_eq!(scanner.last_valid().expect("frame").summary, "ok");
}
