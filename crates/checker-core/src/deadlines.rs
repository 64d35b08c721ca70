//! Deadline schedule and time-decayed credit.
//!
//! A group's credit is a step function over time:
//!
//! ```text
//!   credit
//!   1.0 |######|
//!   0.5 |      |#######|
//!   0.0 +------+-------+------> t
//!     start  step1    end
//! ```
//!
//! Step boundaries are inclusive: at exactly `step1` the new fraction
//! already applies. Past `end` the credit is 0 for [`DeadlineMode::Hard`] and
//! the last step's fraction for [`DeadlineMode::Interpolate`].

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// What happens after a group's `end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineMode {
    #[default]
    Hard,
    Interpolate,
}

/// One gradable task inside a schedule group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleTask {
    pub task: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    pub score: u32,
    /// Threshold score for a large task to count as completed.
    #[serde(default)]
    pub min_score: u32,
    #[serde(default)]
    pub special: u32,
    #[serde(default)]
    pub is_bonus: bool,
    #[serde(default)]
    pub is_large: bool,
    #[serde(default)]
    pub is_special: bool,
    #[serde(default)]
    pub url: Option<String>,
}

pub(crate) fn enabled_default() -> bool {
    true
}

impl ScheduleTask {
    pub fn new(task: impl Into<String>, score: u32) -> Self {
        Self {
            task: task.into(),
            enabled: true,
            score,
            min_score: 0,
            special: 0,
            is_bonus: false,
            is_large: false,
            is_special: false,
            url: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.task
    }
}

/// Resolved deadline entry of one group; all timestamps are absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlineScheduleEntry {
    pub group: String,
    pub enabled: bool,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    /// `(fraction, until)` pairs in increasing time order.
    pub steps: Vec<(f64, DateTime<Tz>)>,
    pub tasks: Vec<ScheduleTask>,
}

impl DeadlineScheduleEntry {
    /// Checkpoints `(fraction, valid_until)`: full credit until the first
    /// step, then each step's fraction until the next, the last one until `end`.
    pub fn checkpoints(&self) -> Vec<(f64, DateTime<Tz>)> {
        let mut fractions = Vec::with_capacity(self.steps.len() + 1);
        fractions.push(1.0);
        fractions.extend(self.steps.iter().map(|(fraction, _)| *fraction));

        let mut bounds: Vec<DateTime<Tz>> = self.steps.iter().map(|(_, at)| *at).collect();
        bounds.push(self.end);

        fractions.into_iter().zip(bounds).collect()
    }

    /// Credit fraction in `[0, 1]` for a submission at `now`.
    pub fn credit(&self, mode: DeadlineMode, now: DateTime<Utc>) -> f64 {
        let now = now.with_timezone(&self.start.timezone());
        if now < self.start {
            return 0.0;
        }
        for (fraction, until) in self.checkpoints() {
            if now < until {
                return fraction;
            }
        }
        match mode {
            DeadlineMode::Hard => 0.0,
            DeadlineMode::Interpolate => self.steps.last().map(|(f, _)| *f).unwrap_or(0.0),
        }
    }

    pub fn is_started(&self, now: DateTime<Utc>) -> bool {
        self.start.with_timezone(&Utc) <= now
    }

    pub fn find_task(&self, name: &str) -> Option<&ScheduleTask> {
        self.tasks.iter().find(|t| t.task == name)
    }
}

/// The whole course schedule plus submission settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlineSchedule {
    pub timezone: Tz,
    pub mode: DeadlineMode,
    pub max_submissions: Option<u32>,
    pub submission_penalty: f64,
    pub groups: Vec<DeadlineScheduleEntry>,
}

impl DeadlineSchedule {
    pub fn find_task(&self, task: &str) -> Option<(&DeadlineScheduleEntry, &ScheduleTask)> {
        self.groups
            .iter()
            .find_map(|group| group.find_task(task).map(|t| (group, t)))
    }

    pub fn find_group(&self, group: &str) -> Option<&DeadlineScheduleEntry> {
        self.groups.iter().find(|g| g.group == group)
    }

    /// Groups filtered by `enabled` / `started` (`None` = no filter).
    pub fn get_groups(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: DateTime<Utc>,
    ) -> Vec<&DeadlineScheduleEntry> {
        self.groups
            .iter()
            .filter(|g| enabled.map_or(true, |e| g.enabled == e))
            .filter(|g| started.map_or(true, |s| g.is_started(now) == s))
            .collect()
    }

    /// Tasks filtered by `enabled` / `started` / `is_bonus`.
    ///
    /// A task counts as enabled only when both it and its group are enabled;
    /// with `enabled = Some(false)` every task of a disabled group is returned.
    pub fn get_tasks(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        is_bonus: Option<bool>,
        now: DateTime<Utc>,
    ) -> Vec<&ScheduleTask> {
        self.get_groups(None, started, now)
            .into_iter()
            .flat_map(|g| g.tasks.iter().map(move |t| (g, t)))
            .filter(|(g, t)| enabled.map_or(true, |e| (g.enabled && t.enabled) == e))
            .filter(|(_, t)| is_bonus.map_or(true, |b| t.is_bonus == b))
            .map(|(_, t)| t)
            .collect()
    }

    /// Sum of enabled, non-bonus task scores.
    pub fn max_score(&self, started: Option<bool>, now: DateTime<Utc>) -> u32 {
        self.get_tasks(Some(true), started, Some(false), now)
            .iter()
            .map(|t| t.score)
            .sum()
    }

    /// Credit for `task` at `now`; unknown tasks get no credit.
    pub fn credit_for(&self, task: &str, now: DateTime<Utc>) -> f64 {
        self.find_task(task)
            .map(|(group, _)| group.credit(self.mode, now))
            .unwrap_or(0.0)
    }

    /// Score to report for `task` given the achieved `percentage` of its tests.
    pub fn effective_score(&self, task: &str, percentage: f64, now: DateTime<Utc>) -> Option<f64> {
        let (group, entry) = self.find_task(task)?;
        Some(effective_score(
            f64::from(entry.score),
            percentage,
            group.credit(self.mode, now),
        ))
    }
}

/// `score × percentage × credit`, capped at `score` unless the raw result
/// already exceeds it (over-solved submissions keep their extra points).
pub fn effective_score(score: f64, percentage: f64, credit: f64) -> f64 {
    let raw = score * percentage;
    if raw > score {
        return raw * credit;
    }
    (raw * credit).min(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(tz: Tz, y: i32, m: u32, d: u32, h: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn entry() -> DeadlineScheduleEntry {
        let tz = chrono_tz::Europe::Berlin;
        DeadlineScheduleEntry {
            group: "intro".to_string(),
            enabled: true,
            start: at(tz, 2024, 1, 1, 12),
            end: at(tz, 2024, 1, 20, 12),
            steps: vec![(0.5, at(tz, 2024, 1, 10, 12)), (0.3, at(tz, 2024, 1, 15, 12))],
            tasks: vec![ScheduleTask::new("hello", 10), {
                let mut bonus = ScheduleTask::new("bonus", 5);
                bonus.is_bonus = true;
                bonus
            }],
        }
    }

    fn utc(dt: DateTime<Tz>) -> DateTime<Utc> {
        dt.with_timezone(&Utc)
    }

    #[test]
    fn test_credit_before_start_is_zero() {
        let e = entry();
        let before = utc(e.start) - Duration::seconds(1);
        assert_eq!(e.credit(DeadlineMode::Hard, before), 0.0);
    }

    #[test]
    fn test_credit_at_start_is_full() {
        let e = entry();
        assert_eq!(e.credit(DeadlineMode::Hard, utc(e.start)), 1.0);
        assert_eq!(e.credit(DeadlineMode::Interpolate, utc(e.start)), 1.0);
    }

    #[test]
    fn test_step_boundary_is_inclusive() {
        let e = entry();
        let step = utc(e.steps[0].1);
        assert_eq!(e.credit(DeadlineMode::Hard, step - Duration::seconds(1)), 1.0);
        assert_eq!(e.credit(DeadlineMode::Hard, step), 0.5);
        assert_eq!(e.credit(DeadlineMode::Hard, utc(e.steps[1].1)), 0.3);
    }

    #[test]
    fn test_credit_at_end() {
        let e = entry();
        assert_eq!(e.credit(DeadlineMode::Hard, utc(e.end)), 0.0);
        assert_eq!(e.credit(DeadlineMode::Interpolate, utc(e.end)), 0.3);
        let later = utc(e.end) + Duration::days(30);
        assert_eq!(e.credit(DeadlineMode::Interpolate, later), 0.3);
    }

    #[test]
    fn test_interpolate_without_steps_ends_at_zero() {
        let mut e = entry();
        e.steps.clear();
        assert_eq!(e.credit(DeadlineMode::Interpolate, utc(e.end)), 0.0);
    }

    #[test]
    fn test_hard_credit_is_non_increasing() {
        let e = entry();
        let mut now = utc(e.start);
        let mut previous = e.credit(DeadlineMode::Hard, now);
        while now <= utc(e.end) + Duration::days(1) {
            let current = e.credit(DeadlineMode::Hard, now);
            assert!(current <= previous, "credit went up at {now}");
            previous = current;
            now += Duration::hours(7);
        }
    }

    #[test]
    fn test_effective_score_clamps_and_keeps_over_solved() {
        assert_eq!(effective_score(10.0, 1.0, 0.5), 5.0);
        assert_eq!(effective_score(10.0, 0.5, 1.0), 5.0);
        // over-solved: 1.5 × 10 survives the cap
        assert_eq!(effective_score(10.0, 1.5, 1.0), 15.0);
        assert_eq!(effective_score(10.0, 1.5, 0.5), 7.5);
    }

    #[test]
    fn test_schedule_queries() {
        let schedule = DeadlineSchedule {
            timezone: chrono_tz::Europe::Berlin,
            mode: DeadlineMode::Hard,
            max_submissions: None,
            submission_penalty: 0.0,
            groups: vec![entry()],
        };
        let now = utc(schedule.groups[0].start) + Duration::hours(1);

        assert_eq!(schedule.max_score(Some(true), now), 10);
        assert_eq!(schedule.get_tasks(Some(true), None, None, now).len(), 2);
        assert_eq!(schedule.get_tasks(None, None, Some(true), now).len(), 1);
        assert!(schedule
            .get_groups(None, Some(true), utc(schedule.groups[0].start) - Duration::days(1))
            .is_empty());
        assert_eq!(schedule.effective_score("hello", 1.0, now), Some(10.0));
        assert_eq!(schedule.effective_score("missing", 1.0, now), None);
    }
}
