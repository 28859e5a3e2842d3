//! Parser for the Android instrumentation transcript.
//!
//! `am instrument -r` emits a line-oriented but not line-delimited protocol:
//! tagged blocks whose values may span lines, terminated only by the next
//! tag. The tokenizer below consumes the transcript prefix-first,
//! accumulating key/value pairs into the current status or result block and
//! flushing on the matching code tag.
//!
//! This module never fails: an instrumentation run that crashed before
//! producing its result block is indistinguishable from a broken build, and
//! the caller has no other channel to report a parse failure for an
//! already-completed device run, so every malformed input degrades to a
//! `CompilationError` carrying diagnostic text.

use std::collections::HashMap;
use std::mem;

use droidgrade_common::types::{CheckResult, InstrumentationCode, TestOutcome};
use tracing::warn;

const STATUS_CODE_TAG: &str = "INSTRUMENTATION_STATUS_CODE:";
const STATUS_TAG: &str = "INSTRUMENTATION_STATUS:";
const RESULT_CODE_TAG: &str = "INSTRUMENTATION_CODE:";
const RESULT_TAG: &str = "INSTRUMENTATION_RESULT:";
const ERROR_TAG: &str = "onError:";

/// A block runs until the next tag of either family begins.
const TERMINATORS: [&str; 2] = ["INSTRUMENTATION", "onError"];

/// The on-device test runner whose status blocks carry per-test outcomes.
const TEST_RUNNER_ID: &str = "AndroidJUnitRunner";

/// Status code `1` marks a block as in-progress; such blocks are dropped,
/// not flushed.
const IN_PROGRESS_SENTINEL: &str = "1";

#[derive(Debug, Default)]
struct ParsedTranscript {
    statuses: Vec<HashMap<String, String>>,
    results: Vec<HashMap<String, String>>,
    errors: Vec<TranscriptError>,
    leftover: String,
}

#[derive(Debug)]
struct TranscriptError {
    #[allow(dead_code)]
    command_error: String,
    message: String,
}

/// Turn one complete transcript into the terminal check result.
pub fn parse_transcript(transcript: &str) -> CheckResult {
    let parsed = tokenize(transcript);

    if !parsed.leftover.is_empty() {
        warn!(leftover = %parsed.leftover, "unparsed instrumentation output");
    }

    // A run that never produced its final result block, or that reported
    // any command error, is reported like a build crash.
    if parsed.results.is_empty() || !parsed.errors.is_empty() {
        let mut message = parsed.leftover.clone();
        for error in &parsed.errors {
            message.push('\n');
            message.push_str(&error.message);
        }
        return CheckResult::compilation_error(message);
    }

    let totals = &parsed.results[0];
    let Some(grade) = grade_field(totals, "grade") else {
        return CheckResult::compilation_error(format!(
            "unparseable grade in instrumentation result: {:?}",
            totals.get("grade")
        ));
    };
    let Some(total_grade) = grade_field(totals, "maxGrade") else {
        return CheckResult::compilation_error(format!(
            "unparseable maxGrade in instrumentation result: {:?}",
            totals.get("maxGrade")
        ));
    };

    let mut test_results = Vec::new();
    for status in &parsed.statuses {
        if status.get("id").map(String::as_str) != Some(TEST_RUNNER_ID) {
            continue;
        }
        let raw_code = status.get("result_code").map(String::as_str).unwrap_or("");
        let code = raw_code
            .parse::<i32>()
            .ok()
            .and_then(InstrumentationCode::from_code);
        let Some(result_code) = code else {
            return CheckResult::compilation_error(format!(
                "unknown instrumentation status code: {raw_code:?}"
            ));
        };
        test_results.push(TestOutcome {
            class: text_field(status, "class"),
            test: text_field(status, "test"),
            stream: text_field(status, "stream"),
            result_code,
        });
    }

    CheckResult::Success {
        grade,
        total_grade,
        test_results,
    }
}

fn tokenize(transcript: &str) -> ParsedTranscript {
    let mut rest = transcript.trim();
    let mut status_fields: HashMap<String, String> = HashMap::new();
    let mut result_fields: HashMap<String, String> = HashMap::new();
    let mut parsed = ParsedTranscript::default();

    while !rest.is_empty() {
        // The longer STATUS_CODE tag is tested before STATUS so prefix
        // matching picks the alternative the protocol intends.
        if let Some(body) = rest.strip_prefix(STATUS_CODE_TAG) {
            let (block, next) = take_block(body);
            let code = first_line(block);
            status_fields.insert("result_code".to_string(), code.to_string());
            if code == IN_PROGRESS_SENTINEL {
                status_fields.clear();
            } else {
                parsed.statuses.push(mem::take(&mut status_fields));
            }
            rest = next.trim();
            continue;
        }
        if let Some(body) = rest.strip_prefix(STATUS_TAG) {
            let (block, next) = take_block(body);
            let (key, value) = split_key_value(block);
            status_fields.insert(key, value);
            rest = next.trim();
            continue;
        }
        if let Some(body) = rest.strip_prefix(RESULT_CODE_TAG) {
            let (block, next) = take_block(body);
            result_fields.insert("result_code".to_string(), first_line(block).to_string());
            // The result accumulator always flushes; a submission produces
            // its terminal result block exactly once.
            parsed.results.push(mem::take(&mut result_fields));
            rest = next.trim();
            continue;
        }
        if let Some(body) = rest.strip_prefix(RESULT_TAG) {
            let (block, next) = take_block(body);
            let (key, value) = split_key_value(block);
            result_fields.insert(key, value);
            rest = next.trim();
            continue;
        }
        if let Some(body) = rest.strip_prefix(ERROR_TAG) {
            let (block, next) = take_block(body);
            if let Some(error) = parse_error_block(block) {
                parsed.errors.push(error);
                rest = next.trim();
                continue;
            }
        }

        // Nothing matched: keep the remainder as trailing noise and stop.
        break;
    }

    parsed.leftover = rest.to_string();
    parsed
}

fn take_block(body: &str) -> (&str, &str) {
    let end = TERMINATORS
        .iter()
        .filter_map(|token| body.find(token))
        .min()
        .unwrap_or(body.len());
    (body[..end].trim(), &body[end..])
}

fn split_key_value(block: &str) -> (String, String) {
    match block.split_once('=') {
        Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
        None => (block.trim().to_string(), String::new()),
    }
}

fn first_line(block: &str) -> &str {
    block.lines().next().unwrap_or("").trim()
}

fn parse_error_block(block: &str) -> Option<TranscriptError> {
    let rest = block.strip_prefix("commandError=")?;

    // The message key must be preceded by whitespace, the way the runner
    // emits it; an `=` inside the command error text does not split.
    let split_at = rest
        .match_indices("message=")
        .find(|(idx, _)| *idx > 0 && rest[..*idx].ends_with(char::is_whitespace))
        .map(|(idx, _)| idx)?;

    Some(TranscriptError {
        command_error: rest[..split_at].trim().to_string(),
        message: rest[split_at + "message=".len()..].trim().to_string(),
    })
}

fn grade_field(fields: &HashMap<String, String>, key: &str) -> Option<i32> {
    fields
        .get(key)
        .map(String::as_str)
        .unwrap_or("0")
        .trim()
        .parse()
        .ok()
}

fn text_field(fields: &HashMap<String, String>, key: &str) -> String {
    fields.get(key).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_test_status(outcome: &TestOutcome) -> String {
        format!(
            "INSTRUMENTATION_STATUS: id=AndroidJUnitRunner\n\
             INSTRUMENTATION_STATUS: class={}\n\
             INSTRUMENTATION_STATUS: test={}\n\
             INSTRUMENTATION_STATUS: stream={}\n\
             INSTRUMENTATION_STATUS_CODE: {}\n",
            outcome.class,
            outcome.test,
            outcome.stream,
            outcome.result_code.code()
        )
    }

    #[test]
    fn parses_a_complete_run() {
        let transcript = "INSTRUMENTATION_STATUS: id=AndroidJUnitRunner\n\
                          INSTRUMENTATION_STATUS: class=FooTest\n\
                          INSTRUMENTATION_STATUS: test=bar\n\
                          INSTRUMENTATION_STATUS: stream=ok\n\
                          INSTRUMENTATION_STATUS_CODE: 0\n\
                          INSTRUMENTATION_RESULT: grade=80\n\
                          INSTRUMENTATION_RESULT: maxGrade=100\n\
                          INSTRUMENTATION_CODE: 1";

        let result = parse_transcript(transcript);

        assert_eq!(
            result,
            CheckResult::Success {
                grade: 80,
                total_grade: 100,
                test_results: vec![TestOutcome {
                    class: "FooTest".into(),
                    test: "bar".into(),
                    stream: "ok".into(),
                    result_code: InstrumentationCode::Success,
                }],
            }
        );
    }

    #[test]
    fn empty_transcript_is_a_compilation_error() {
        assert!(matches!(
            parse_transcript(""),
            CheckResult::CompilationError { .. }
        ));
    }

    #[test]
    fn in_progress_status_blocks_are_dropped() {
        let transcript = "INSTRUMENTATION_STATUS: id=AndroidJUnitRunner\n\
                          INSTRUMENTATION_STATUS: class=FooTest\n\
                          INSTRUMENTATION_STATUS: test=bar\n\
                          INSTRUMENTATION_STATUS_CODE: 1\n\
                          INSTRUMENTATION_STATUS: id=AndroidJUnitRunner\n\
                          INSTRUMENTATION_STATUS: class=FooTest\n\
                          INSTRUMENTATION_STATUS: test=bar\n\
                          INSTRUMENTATION_STATUS: stream=done\n\
                          INSTRUMENTATION_STATUS_CODE: 0\n\
                          INSTRUMENTATION_RESULT: grade=10\n\
                          INSTRUMENTATION_CODE: 1";

        let CheckResult::Success { test_results, .. } = parse_transcript(transcript) else {
            panic!("expected success");
        };
        assert_eq!(test_results.len(), 1);
        assert_eq!(test_results[0].stream, "done");
    }

    #[test]
    fn an_error_block_dominates_even_with_a_result_present() {
        let transcript = "INSTRUMENTATION_RESULT: grade=100\n\
                          INSTRUMENTATION_CODE: 1\n\
                          onError: commandError=true message=INSTRUMENTATION_FAILED: not installed";

        let CheckResult::CompilationError { compilation_error } = parse_transcript(transcript)
        else {
            panic!("expected compilation error");
        };
        assert!(compilation_error.contains("INSTRUMENTATION_FAILED: not installed"));
    }

    #[test]
    fn missing_grade_fields_default_to_zero() {
        let transcript = "INSTRUMENTATION_RESULT: stream=.\nINSTRUMENTATION_CODE: -1";

        assert_eq!(
            parse_transcript(transcript),
            CheckResult::Success {
                grade: 0,
                total_grade: 0,
                test_results: vec![],
            }
        );
    }

    #[test]
    fn unparseable_grade_degrades_to_compilation_error() {
        let transcript = "INSTRUMENTATION_RESULT: grade=lots\nINSTRUMENTATION_CODE: 1";

        assert!(matches!(
            parse_transcript(transcript),
            CheckResult::CompilationError { .. }
        ));
    }

    #[test]
    fn statuses_from_other_runners_are_filtered_out() {
        let transcript = "INSTRUMENTATION_STATUS: id=SomethingElse\n\
                          INSTRUMENTATION_STATUS: class=Alien\n\
                          INSTRUMENTATION_STATUS_CODE: 0\n\
                          INSTRUMENTATION_RESULT: grade=5\n\
                          INSTRUMENTATION_RESULT: maxGrade=5\n\
                          INSTRUMENTATION_CODE: 1";

        let CheckResult::Success { test_results, .. } = parse_transcript(transcript) else {
            panic!("expected success");
        };
        assert!(test_results.is_empty());
    }

    #[test]
    fn trailing_noise_does_not_break_a_completed_run() {
        let transcript = "INSTRUMENTATION_RESULT: grade=7\n\
                          INSTRUMENTATION_RESULT: maxGrade=10\n\
                          INSTRUMENTATION_CODE: 1\n\
                          some garbage the runner printed on the way out";

        let CheckResult::Success { grade, total_grade, .. } = parse_transcript(transcript) else {
            panic!("expected success");
        };
        assert_eq!((grade, total_grade), (7, 10));
    }

    #[test]
    fn noise_only_transcript_carries_the_noise_in_the_error() {
        let CheckResult::CompilationError { compilation_error } =
            parse_transcript("FAILURE: Build failed with an exception.")
        else {
            panic!("expected compilation error");
        };
        assert!(compilation_error.contains("Build failed"));
    }

    #[test]
    fn multi_line_stream_values_survive() {
        let transcript = "INSTRUMENTATION_STATUS: id=AndroidJUnitRunner\n\
                          INSTRUMENTATION_STATUS: class=FooTest\n\
                          INSTRUMENTATION_STATUS: test=bar\n\
                          INSTRUMENTATION_STATUS: stream=expected: <1>\nbut was: <2>\n\
                          INSTRUMENTATION_STATUS_CODE: -2\n\
                          INSTRUMENTATION_RESULT: grade=0\n\
                          INSTRUMENTATION_RESULT: maxGrade=10\n\
                          INSTRUMENTATION_CODE: 1";

        let CheckResult::Success { test_results, .. } = parse_transcript(transcript) else {
            panic!("expected success");
        };
        assert_eq!(test_results[0].stream, "expected: <1>\nbut was: <2>");
        assert_eq!(test_results[0].result_code, InstrumentationCode::Failure);
    }

    #[test]
    fn unknown_status_code_degrades_to_compilation_error() {
        let transcript = "INSTRUMENTATION_STATUS: id=AndroidJUnitRunner\n\
                          INSTRUMENTATION_STATUS_CODE: 9\n\
                          INSTRUMENTATION_RESULT: grade=1\n\
                          INSTRUMENTATION_CODE: 1";

        assert!(matches!(
            parse_transcript(transcript),
            CheckResult::CompilationError { .. }
        ));
    }

    #[test]
    fn synthetic_transcripts_round_trip() {
        let outcomes = vec![
            TestOutcome {
                class: "CalculatorTest".into(),
                test: "adds".into(),
                stream: ".".into(),
                result_code: InstrumentationCode::Success,
            },
            TestOutcome {
                class: "CalculatorTest".into(),
                test: "divides".into(),
                stream: "java.lang.ArithmeticException".into(),
                result_code: InstrumentationCode::Error,
            },
            TestOutcome {
                class: "CalculatorTest".into(),
                test: "skipped".into(),
                stream: "ignored".into(),
                result_code: InstrumentationCode::Ignored,
            },
        ];

        let mut transcript = String::new();
        for outcome in &outcomes {
            transcript.push_str(&render_test_status(outcome));
        }
        transcript.push_str(
            "INSTRUMENTATION_RESULT: grade=66\n\
             INSTRUMENTATION_RESULT: maxGrade=100\n\
             INSTRUMENTATION_CODE: 1\n",
        );

        assert_eq!(
            parse_transcript(&transcript),
            CheckResult::Success {
                grade: 66,
                total_grade: 100,
                test_results: outcomes,
            }
        );
    }
}
