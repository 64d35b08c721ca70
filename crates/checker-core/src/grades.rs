//! Grade classification over ordered DNF rules.
//!
//! A [`GradeRule`] maps one grade value to a disjunction of conjunctions.
//! Each conjunction is a set of `path -> minimum` thresholds over a student's
//! [`StudentStats`]. Rules are tried from the highest grade down and the
//! first match wins.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::deadlines::DeadlineSchedule;
use crate::domain::error::{CheckerError, Result};

/// `attribute path -> minimum value`; matches when every threshold is met.
pub type Conjunction = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRule {
    pub grade_value: i64,
    pub conditions: Vec<Conjunction>,
}

impl GradeRule {
    pub fn new(grade_value: i64, conditions: Vec<Conjunction>) -> Self {
        Self {
            grade_value,
            conditions,
        }
    }

    pub fn matches(&self, stats: &StudentStats) -> bool {
        self.conditions.iter().any(|conjunction| {
            conjunction
                .iter()
                .all(|(path, min)| stats.get(path) >= *min)
        })
    }
}

/// Build rules from `(grade_value, conditions)` entries in file order,
/// rejecting duplicate grade values. The result is sorted highest first.
pub fn rules_from_entries(entries: Vec<(i64, Vec<Conjunction>)>) -> Result<Vec<GradeRule>> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(entries.len());
    for (grade_value, conditions) in entries {
        if !seen.insert(grade_value) {
            return Err(CheckerError::config(format!(
                "grade value {grade_value} is declared more than once"
            )));
        }
        rules.push(GradeRule::new(grade_value, conditions));
    }
    rules.sort_by(|a, b| b.grade_value.cmp(&a.grade_value));
    Ok(rules)
}

/// Highest grade whose conditions `stats` satisfies.
pub fn classify(rules: &[GradeRule], stats: &StudentStats) -> Result<i64> {
    let mut seen = HashSet::new();
    if let Some(dup) = rules.iter().find(|r| !seen.insert(r.grade_value)) {
        return Err(CheckerError::config(format!(
            "grade value {} is declared more than once",
            dup.grade_value
        )));
    }

    let mut ordered: Vec<&GradeRule> = rules.iter().collect();
    ordered.sort_by(|a, b| b.grade_value.cmp(&a.grade_value));

    ordered
        .into_iter()
        .find(|rule| rule.matches(stats))
        .map(|rule| rule.grade_value)
        .ok_or_else(|| {
            CheckerError::Grade(format!(
                "no grade rule matches {}; add a catch-all rule",
                stats.as_value()
            ))
        })
}

/// Nested numeric view of a student's results, addressed by `/` paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudentStats(Value);

impl StudentStats {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Numeric value at `path`; missing or non-numeric attributes read as 0.
    pub fn get(&self, path: &str) -> f64 {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(&self.0, |node, segment| node.get(segment))
            .and_then(|leaf| match leaf {
                Value::Number(n) => n.as_f64(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            })
            .unwrap_or(0.0)
    }

    /// Derive the stats from raw per-task scores.
    ///
    /// * `total_score`: sum of all scores, bonus included
    /// * `max_score`: sum of enabled, started, non-bonus task scores
    /// * `percent`: `total_score / max_score` in 0..=100
    /// * `large_count`: large tasks scored at or above their `min_score`
    /// * `bonus_score`: sum of bonus task scores
    /// * `scores/<task>`: the raw scores
    pub fn compute(
        schedule: &DeadlineSchedule,
        scores: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Self {
        let total_score: f64 = scores.values().sum();
        let max_score = f64::from(schedule.max_score(Some(true), now));
        let percent = if max_score > 0.0 {
            total_score / max_score * 100.0
        } else {
            0.0
        };

        let mut large_count = 0u32;
        let mut bonus_score = 0.0;
        for (task, score) in scores {
            let Some((_, entry)) = schedule.find_task(task) else {
                continue;
            };
            if entry.is_large && *score > 0.0 && *score >= f64::from(entry.min_score) {
                large_count += 1;
            }
            if entry.is_bonus {
                bonus_score += score;
            }
        }

        let per_task: Map<String, Value> = scores
            .iter()
            .map(|(task, score)| (task.clone(), Value::from(*score)))
            .collect();

        Self(serde_json::json!({
            "total_score": total_score,
            "max_score": max_score,
            "percent": percent,
            "large_count": large_count,
            "bonus_score": bonus_score,
            "scores": per_task,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadlines::{DeadlineMode, DeadlineScheduleEntry, ScheduleTask};
    use chrono::TimeZone;
    use serde_json::json;

    fn conj(pairs: &[(&str, f64)]) -> Conjunction {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn rules() -> Vec<GradeRule> {
        vec![
            GradeRule::new(2, vec![conj(&[("percent", 0.0)])]),
            GradeRule::new(
                5,
                vec![
                    conj(&[("percent", 90.0), ("large_count", 1.0)]),
                    conj(&[("percent", 80.0), ("large_count", 2.0)]),
                ],
            ),
            GradeRule::new(4, vec![conj(&[("percent", 70.0)])]),
        ]
    }

    #[test]
    fn test_classify_picks_highest_matching_disjunct() {
        let stats = StudentStats::from_value(json!({"percent": 85, "large_count": 2}));
        assert_eq!(classify(&rules(), &stats).unwrap(), 5);
    }

    #[test]
    fn test_classify_falls_through_to_lower_grade() {
        let stats = StudentStats::from_value(json!({"percent": 85, "large_count": 1}));
        assert_eq!(classify(&rules(), &stats).unwrap(), 4);

        let stats = StudentStats::from_value(json!({"percent": 10}));
        assert_eq!(classify(&rules(), &stats).unwrap(), 2);
    }

    #[test]
    fn test_classify_without_match_fails_loudly() {
        let strict = vec![GradeRule::new(3, vec![conj(&[("percent", 50.0)])])];
        let stats = StudentStats::from_value(json!({"percent": 10}));
        let err = classify(&strict, &stats).unwrap_err();
        assert!(matches!(err, CheckerError::Grade(_)));
    }

    #[test]
    fn test_duplicate_grade_values_are_rejected() {
        let dup = vec![
            GradeRule::new(3, vec![conj(&[("percent", 50.0)])]),
            GradeRule::new(3, vec![conj(&[("percent", 0.0)])]),
        ];
        let err = classify(&dup, &StudentStats::default()).unwrap_err();
        assert!(err.is_validation());

        let err = rules_from_entries(vec![(1, vec![]), (1, vec![])]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_nested_paths() {
        let stats = StudentStats::from_value(json!({"scores": {"hello": 7}}));
        assert_eq!(stats.get("scores/hello"), 7.0);
        assert_eq!(stats.get("scores/missing"), 0.0);
        assert_eq!(stats.get("nothing/here"), 0.0);

        let rule = GradeRule::new(1, vec![conj(&[("scores/hello", 5.0)])]);
        assert!(rule.matches(&stats));
    }

    #[test]
    fn test_compute_stats() {
        let tz = chrono_tz::UTC;
        let mut large = ScheduleTask::new("large", 20);
        large.is_large = true;
        large.min_score = 10;
        let mut bonus = ScheduleTask::new("bonus", 5);
        bonus.is_bonus = true;

        let schedule = DeadlineSchedule {
            timezone: tz,
            mode: DeadlineMode::Hard,
            max_submissions: None,
            submission_penalty: 0.0,
            groups: vec![DeadlineScheduleEntry {
                group: "g".to_string(),
                enabled: true,
                start: tz.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end: tz.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
                steps: vec![],
                tasks: vec![ScheduleTask::new("small", 20), large, bonus],
            }],
        };
        let scores: BTreeMap<String, f64> = [
            ("small".to_string(), 20.0),
            ("large".to_string(), 12.0),
            ("bonus".to_string(), 4.0),
        ]
        .into_iter()
        .collect();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();

        let stats = StudentStats::compute(&schedule, &scores, now);
        assert_eq!(stats.get("total_score"), 36.0);
        assert_eq!(stats.get("max_score"), 40.0);
        assert_eq!(stats.get("percent"), 90.0);
        assert_eq!(stats.get("large_count"), 1.0);
        assert_eq!(stats.get("bonus_score"), 4.0);
        assert_eq!(stats.get("scores/large"), 12.0);
    }
}
