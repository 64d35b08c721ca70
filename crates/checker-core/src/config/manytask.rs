//! `.manytask.yml`: course settings, deadline schedule and grade table.
//!
//! The file is parsed into raw serde structs first, then validated and
//! resolved into absolute-time [`DeadlineSchedule`] entries.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use super::{ensure_version, parse_yaml, read_yaml};
use crate::deadlines::{enabled_default, ScheduleTask};
use crate::domain::error::{CheckerError, Result};
use crate::grades::GradeRule;

pub use crate::deadlines::{DeadlineMode, DeadlineSchedule, DeadlineScheduleEntry};

/// `settings` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManytaskSettings {
    pub timezone: String,
    #[serde(default)]
    pub deadlines: DeadlineMode,
    #[serde(default)]
    pub max_submissions: Option<u32>,
    #[serde(default)]
    pub submission_penalty: f64,
    #[serde(default)]
    pub course_name: Option<String>,
    #[serde(default)]
    pub gitlab_base_url: Option<String>,
    #[serde(default)]
    pub public_repo: Option<String>,
    #[serde(default)]
    pub students_group: Option<String>,
}

/// A schedule timestamp or an offset from the group start.
#[derive(Debug, Clone, PartialEq)]
pub enum DateOrDelta {
    Local(NaiveDateTime),
    Fixed(DateTime<FixedOffset>),
    Delta(Duration),
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

impl DateOrDelta {
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let raw = raw.trim();
        if let Ok(fixed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Self::Fixed(fixed));
        }
        if let Ok(fixed) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z") {
            return Ok(Self::Fixed(fixed));
        }
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Ok(Self::Local(naive));
            }
        }
        humantime_serde::re::humantime::parse_duration(raw)
            .map_err(|e| format!("`{raw}` is neither a timestamp nor a duration: {e}"))
            .and_then(|d| {
                Duration::from_std(d).map_err(|e| format!("duration `{raw}` out of range: {e}"))
            })
            .map(Self::Delta)
    }

    fn resolve(&self, tz: Tz, start: Option<DateTime<Tz>>) -> std::result::Result<DateTime<Tz>, String> {
        match self {
            Self::Local(naive) => tz
                .from_local_datetime(naive)
                .earliest()
                .ok_or_else(|| format!("{naive} does not exist in {tz}")),
            Self::Fixed(fixed) => Ok(fixed.with_timezone(&tz)),
            Self::Delta(delta) => {
                let start = start.ok_or("group start cannot be a duration")?;
                if *delta < Duration::zero() {
                    return Err(format!("duration {delta} must be positive"));
                }
                Ok(start + *delta)
            }
        }
    }
}

impl<'de> Deserialize<'de> for DateOrDelta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateOrDelta::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Deserialize a YAML mapping keeping its entries in document order,
/// duplicates included.
fn ordered_entries<'de, D, K, V>(deserializer: D) -> std::result::Result<Vec<(K, V)>, D::Error>
where
    D: Deserializer<'de>,
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    struct EntriesVisitor<K, V>(PhantomData<(K, V)>);

    impl<'de, K: DeserializeOwned, V: DeserializeOwned> Visitor<'de> for EntriesVisitor<K, V> {
        type Value = Vec<(K, V)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut entries = Vec::new();
            while let Some((key, value)) = map.next_entry()? {
                entries.push((key, value));
            }
            Ok(entries)
        }

        fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_any(EntriesVisitor(PhantomData))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    group: String,
    #[serde(default = "enabled_default")]
    enabled: bool,
    start: DateOrDelta,
    #[serde(default, deserialize_with = "ordered_entries")]
    steps: Vec<(f64, DateOrDelta)>,
    end: DateOrDelta,
    #[serde(default)]
    tasks: Vec<ScheduleTask>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManytask {
    version: Option<u32>,
    settings: ManytaskSettings,
    #[serde(default)]
    ui: Option<serde_json::Value>,
    #[serde(default)]
    schedule: Vec<RawGroup>,
    #[serde(default, deserialize_with = "ordered_entries")]
    grades: Vec<(i64, Vec<BTreeMap<String, f64>>)>,
}

/// Validated `.manytask.yml`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManytaskConfig {
    pub settings: ManytaskSettings,
    pub schedule: DeadlineSchedule,
    /// Sorted by grade value, highest first.
    pub grades: Vec<GradeRule>,
}

impl ManytaskConfig {
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let raw: RawManytask = read_yaml(path)?;
        Self::from_raw(raw)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: RawManytask = parse_yaml("<inline>", content)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawManytask) -> Result<Self> {
        ensure_version("ManytaskConfig", raw.version)?;
        let settings = raw.settings;

        let timezone: Tz = settings.timezone.parse().map_err(|e| {
            CheckerError::config(format!("unknown timezone `{}`: {e}", settings.timezone))
        })?;
        if settings.max_submissions == Some(0) {
            return Err(CheckerError::config("max_submissions should be positive"));
        }
        if settings.submission_penalty < 0.0 {
            return Err(CheckerError::config(
                "submission_penalty should be non-negative",
            ));
        }

        check_unique(
            "group",
            raw.schedule.iter().map(|g| g.group.as_str()),
        )?;
        check_unique(
            "task",
            raw.schedule
                .iter()
                .flat_map(|g| g.tasks.iter().map(|t| t.task.as_str())),
        )?;

        let groups = raw
            .schedule
            .into_iter()
            .map(|g| resolve_group(g, timezone))
            .collect::<Result<Vec<_>>>()?;

        let grades = crate::grades::rules_from_entries(raw.grades)?;
        debug!(
            groups = groups.len(),
            grades = grades.len(),
            "loaded manytask config"
        );

        Ok(Self {
            schedule: DeadlineSchedule {
                timezone,
                mode: settings.deadlines,
                max_submissions: settings.max_submissions,
                submission_penalty: settings.submission_penalty,
                groups,
            },
            settings,
            grades,
        })
    }
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    let mut duplicates: Vec<&str> = Vec::new();
    for name in names {
        if !seen.insert(name) && !duplicates.contains(&name) {
            duplicates.push(name);
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(CheckerError::config(format!(
            "{kind} names should be unique, duplicates: {duplicates:?}"
        )))
    }
}

fn resolve_group(raw: RawGroup, tz: Tz) -> Result<DeadlineScheduleEntry> {
    let group_err = |reason: String| CheckerError::config(format!("group `{}`: {reason}", raw.group));

    let start = raw.start.resolve(tz, None).map_err(group_err)?;
    let end = raw.end.resolve(tz, Some(start)).map_err(group_err)?;
    if end < start {
        return Err(group_err(format!(
            "end {end} should not be before start {start}"
        )));
    }

    let mut steps = Vec::with_capacity(raw.steps.len());
    let mut last_at = start;
    let mut last_fraction = 1.0;
    for (fraction, at) in &raw.steps {
        if !(0.0..=1.0).contains(fraction) {
            return Err(group_err(format!("step fraction {fraction} is outside [0, 1]")));
        }
        if *fraction > last_fraction {
            return Err(group_err(format!(
                "step fraction {fraction} is larger than the previous {last_fraction}"
            )));
        }
        let at = at.resolve(tz, Some(start)).map_err(group_err)?;
        if at <= last_at {
            return Err(group_err(format!(
                "step {at} should be after the previous step {last_at}"
            )));
        }
        if at > end {
            return Err(group_err(format!("step {at} is after the end {end}")));
        }
        steps.push((*fraction, at));
        last_at = at;
        last_fraction = *fraction;
    }

    Ok(DeadlineScheduleEntry {
        group: raw.group,
        enabled: raw.enabled,
        start,
        end,
        steps,
        tasks: raw.tasks,
    })
}
