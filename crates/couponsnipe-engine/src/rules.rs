//! Response classification — success / stop / continue.
//!
//! Evaluation order: success rules, stop rules, terminal phrases, the
//! time-validation message class, then a default continue. The body is
//! parsed as JSON at most once per classification; parse failure is
//! non-fatal (structured rules simply don't match). Nothing here panics or
//! returns an error — malformed input classifies as continue.

use serde_json::Value;

use crate::dispatch::ResponseRecord;
use crate::task::{Rule, RuleSet};

/// Messages that mean "the window has not opened yet, poll harder", emitted
/// by sites that validate the claim time server-side.
const TIME_VALIDATION_PHRASES: [&str; 2] = ["时间验证失败", "time validation failed"];

/// Classification verdict for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// A success rule matched; the run is over.
    Success,
    /// A stop rule or terminal phrase matched; retrying is pointless.
    Stop(String),
    /// Keep retrying. `time_validation` tells the retry loop to tighten its
    /// interval once the failure count crosses its threshold.
    Continue { time_validation: bool, reason: String },
}

/// Evaluate a response against a task's rule set.
pub fn classify(response: &ResponseRecord, rules: &RuleSet) -> Verdict {
    let json: Option<Value> = serde_json::from_str(&response.body).ok();

    if rules.success.iter().any(|r| rule_matches(r, response, json.as_ref())) {
        return Verdict::Success;
    }

    if rules.stop.iter().any(|r| rule_matches(r, response, json.as_ref())) {
        return Verdict::Stop("stop rule matched".into());
    }

    let body_lower = response.body.to_lowercase();
    for phrase in &rules.stop_phrases {
        if body_lower.contains(&phrase.to_lowercase()) {
            return Verdict::Stop(format!("terminal phrase: {phrase}"));
        }
    }

    for phrase in TIME_VALIDATION_PHRASES {
        if body_lower.contains(phrase) {
            return Verdict::Continue {
                time_validation: true,
                reason: "time validation failed".into(),
            };
        }
    }

    // Structured rules that could not be evaluated at all are flagged so the
    // caller can tell "no match" from "nothing to match against".
    let reason = if json.is_none() && has_only_json_rules(rules) {
        "classification-indeterminate".into()
    } else {
        format!("no rule matched (status {})", response.status)
    };
    Verdict::Continue { time_validation: false, reason }
}

fn has_only_json_rules(rules: &RuleSet) -> bool {
    let all = rules.success.iter().chain(rules.stop.iter());
    let mut any = false;
    for rule in all {
        any = true;
        if !matches!(rule, Rule::JsonEquals { .. } | Rule::JsonNotEquals { .. }) {
            return false;
        }
    }
    any
}

fn rule_matches(rule: &Rule, response: &ResponseRecord, json: Option<&Value>) -> bool {
    match rule {
        Rule::StatusCode { value } => response.status == *value,
        Rule::BodyContains { value } => {
            response.body.to_lowercase().contains(&value.to_lowercase())
        }
        Rule::JsonEquals { path, value } => json
            .and_then(|j| json_path(j, path))
            .map(|v| loose_eq(v, value))
            .unwrap_or(false),
        Rule::JsonNotEquals { path, value } => json
            .and_then(|j| json_path(j, path))
            .map(|v| !loose_eq(v, value))
            .unwrap_or(false),
    }
}

/// Walk a dotted path (`data.code`) into a JSON value.
fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

/// Equality that tolerates number-vs-string drift (`0` vs `"0"`), which the
/// target sites mix freely.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim() == n.to_string()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{RuleSet, default_stop_phrases};
    use std::collections::BTreeMap;

    fn response(status: u16, body: &str) -> ResponseRecord {
        ResponseRecord {
            status,
            body: body.into(),
            headers: BTreeMap::new(),
            duration_ms: 1.0,
            completed_at: 0,
            path: "standard".into(),
        }
    }

    fn rules(success: Vec<Rule>, stop: Vec<Rule>) -> RuleSet {
        RuleSet { success, stop, stop_phrases: default_stop_phrases() }
    }

    #[test]
    fn test_status_code_success() {
        let rs = rules(vec![Rule::StatusCode { value: 200 }], vec![]);
        assert_eq!(classify(&response(200, ""), &rs), Verdict::Success);
        assert!(matches!(classify(&response(500, ""), &rs), Verdict::Continue { .. }));
    }

    #[test]
    fn test_body_contains_is_case_insensitive() {
        let rs = rules(vec![Rule::BodyContains { value: "GRABBED".into() }], vec![]);
        assert_eq!(classify(&response(200, "coupon grabbed!"), &rs), Verdict::Success);
    }

    #[test]
    fn test_json_field_equality_with_dotted_path() {
        let rs = rules(
            vec![Rule::JsonEquals { path: "data.code".into(), value: serde_json::json!(0) }],
            vec![],
        );
        assert_eq!(classify(&response(200, r#"{"data":{"code":0}}"#), &rs), Verdict::Success);
        // String "0" matches number 0 — sites mix the two.
        assert_eq!(classify(&response(200, r#"{"data":{"code":"0"}}"#), &rs), Verdict::Success);
        assert!(matches!(
            classify(&response(200, r#"{"data":{"code":1}}"#), &rs),
            Verdict::Continue { .. }
        ));
    }

    #[test]
    fn test_stop_rule_beats_continue() {
        let rs = rules(
            vec![Rule::StatusCode { value: 200 }],
            vec![Rule::StatusCode { value: 404 }],
        );
        assert!(matches!(classify(&response(404, ""), &rs), Verdict::Stop(_)));
    }

    #[test]
    fn test_success_evaluated_before_stop() {
        // A response matching both classifies as success.
        let rs = rules(
            vec![Rule::StatusCode { value: 200 }],
            vec![Rule::BodyContains { value: "done".into() }],
        );
        assert_eq!(classify(&response(200, "done"), &rs), Verdict::Success);
    }

    #[test]
    fn test_terminal_phrases_stop_the_run() {
        let rs = RuleSet::default();
        for body in ["{\"msg\":\"已经领取过\"}", "Sorry, ALREADY CLAIMED.", "库存不足"] {
            match classify(&response(500, body), &rs) {
                Verdict::Stop(reason) => assert!(reason.contains("terminal phrase")),
                other => panic!("expected stop for {body:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_time_validation_flags_continue() {
        let rs = RuleSet::default();
        match classify(&response(400, r#"{"msg":"时间验证失败"}"#), &rs) {
            Verdict::Continue { time_validation, .. } => assert!(time_validation),
            other => panic!("expected continue, got {other:?}"),
        }
        match classify(&response(400, "time validation failed, retry"), &rs) {
            Verdict::Continue { time_validation, .. } => assert!(time_validation),
            other => panic!("expected continue, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_body_with_json_rules_is_indeterminate() {
        let rs = rules(
            vec![Rule::JsonEquals { path: "code".into(), value: serde_json::json!(0) }],
            vec![],
        );
        match classify(&response(200, "<html>not json</html>"), &rs) {
            Verdict::Continue { time_validation, reason } => {
                assert!(!time_validation);
                assert_eq!(reason, "classification-indeterminate");
            }
            other => panic!("expected continue, got {other:?}"),
        }
    }

    #[test]
    fn test_default_is_continue() {
        let rs = RuleSet::default();
        assert!(matches!(
            classify(&response(500, "temporary wobble"), &rs),
            Verdict::Continue { time_validation: false, .. }
        ));
    }
}
