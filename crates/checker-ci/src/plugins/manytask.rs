//! `report_score_manytask`: push a task score to the course server.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::plugin::{Invocation, Plugin, PluginError, PluginOutput, PluginResult};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";
const MAX_RETRIES: u32 = 3;
const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

fn default_patterns() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportScoreArgs {
    /// Folder whose matching files are attached to the report.
    #[serde(default)]
    pub origin: Option<PathBuf>,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    pub username: String,
    pub task_name: String,
    /// `None` lets the server compute the score.
    pub score: Option<f64>,
    pub report_url: String,
    pub report_token: String,
    pub check_deadline: bool,
    /// RFC 3339 or `YYYY-MM-DD HH:MM:SS+ZZZZ`; defaults to now.
    #[serde(default)]
    pub send_time: Option<String>,
}

pub struct ReportScorePlugin {
    client: reqwest::Client,
    backoff: Duration,
}

impl Default for ReportScorePlugin {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            backoff: Duration::from_secs(1),
        }
    }
}

impl ReportScorePlugin {
    /// Base delay between retries; doubles on each attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn post_with_retries(
        &self,
        url: &reqwest::Url,
        token: &str,
        fields: &[(&'static str, String)],
        files: &[(String, String, Vec<u8>)],
    ) -> PluginResult<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let mut form = Form::new();
            for (key, value) in fields {
                form = form.text(*key, value.clone());
            }
            for (field, file_name, bytes) in files {
                form = form.part(field.clone(), Part::bytes(bytes.clone()).file_name(file_name.clone()));
            }

            let sent = self
                .client
                .post(url.clone())
                .bearer_auth(token)
                .multipart(form)
                .send()
                .await;
            let retryable = match &sent {
                Ok(response) => RETRY_STATUSES.contains(&response.status()),
                Err(e) => e.is_connect() || e.is_timeout(),
            };
            if !retryable || attempt >= MAX_RETRIES {
                return sent.map_err(|e| PluginError::failed(format!("Report request failed: {e}"), ""));
            }
            attempt += 1;
            let delay = self.backoff * 2u32.pow(attempt - 1);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "score report failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

fn parse_send_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, TIME_FORMAT))
        .ok()
}

fn collect_files(origin: &std::path::Path, patterns: &[String]) -> PluginResult<Vec<(String, String, Vec<u8>)>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let full = origin.join(pattern);
        let paths = glob::glob(&full.to_string_lossy()).map_err(|e| {
            PluginError::args(ReportScorePlugin::NAME, format!("bad pattern `{pattern}`: {e}"))
        })?;
        for path in paths.flatten().filter(|p| p.is_file()) {
            let bytes = std::fs::read(&path)
                .map_err(|e| PluginError::failed(format!("cannot read {}: {e}", path.display()), ""))?;
            let field = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let relative = path
                .strip_prefix(origin)
                .unwrap_or(path.as_path())
                .to_string_lossy()
                .into_owned();
            files.push((field, relative, bytes));
        }
    }
    Ok(files)
}

#[async_trait]
impl Plugin for ReportScorePlugin {
    const NAME: &'static str = "report_score_manytask";
    type Args = ReportScoreArgs;

    async fn run(&self, args: ReportScoreArgs, invocation: &Invocation) -> PluginResult<PluginOutput> {
        let mut output = Vec::new();
        let url = reqwest::Url::parse(&args.report_url)
            .map_err(|e| PluginError::args(Self::NAME, format!("bad report_url: {e}")))?;
        let send_time = match &args.send_time {
            Some(raw) => parse_send_time(raw)
                .ok_or_else(|| PluginError::args(Self::NAME, format!("bad send_time `{raw}`")))?,
            None => Local::now().fixed_offset(),
        };

        let mut fields = vec![
            ("task", args.task_name.clone()),
            ("username", args.username.clone()),
            ("check_deadline", args.check_deadline.to_string()),
            ("submit_time", send_time.format(TIME_FORMAT).to_string()),
        ];
        if let Some(score) = args.score {
            fields.push(("score", score.to_string()));
        }

        let files = match &args.origin {
            Some(origin) => collect_files(origin, &args.patterns)?,
            None => Vec::new(),
        };
        if invocation.verbose && !files.is_empty() {
            let names: Vec<&str> = files.iter().map(|(_, rel, _)| rel.as_str()).collect();
            output.push(format!("Attached files: {}", names.join(", ")));
        }

        debug!(task = %args.task_name, user = %args.username, "reporting score");
        let response = self
            .post_with_retries(&url, &args.report_token, &fields, &files)
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PluginError::failed(
                format!("{}: {body}", status.as_u16()),
                output.join("\n"),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|_| PluginError::failed("Unable to decode response", output.join("\n")))?;
        let Some(result_score) = body.get("score") else {
            return Err(PluginError::failed("Unable to decode response", output.join("\n")));
        };
        let requested = args
            .score
            .map_or_else(|| "none".to_string(), |s| s.to_string());
        output.push(format!(
            "Report for task '{}' for user '{}', requested score: {requested}, result score: {result_score}",
            args.task_name, args.username
        ));
        Ok(PluginOutput::new(output.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::plugin::DynPlugin;

    fn plugin() -> ReportScorePlugin {
        ReportScorePlugin::default().with_backoff(Duration::from_millis(5))
    }

    fn args(server: &MockServer) -> Value {
        json!({
            "username": "student",
            "task_name": "hello",
            "score": 0.5,
            "report_url": format!("{}/api/report", server.uri()),
            "report_token": "secret-token",
            "check_deadline": true,
            "send_time": "2024-01-03T12:00:00+01:00",
        })
    }

    #[tokio::test]
    async fn test_report_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/report"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 5})))
            .expect(1)
            .mount(&server)
            .await;

        let output = plugin()
            .invoke(args(&server), &Invocation::new(false))
            .await
            .unwrap();
        assert!(output.output.contains("result score: 5"));
        assert!(!output.output.contains("secret-token"));
    }

    #[tokio::test]
    async fn test_client_error_is_stage_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("wrong token"))
            .expect(1)
            .mount(&server)
            .await;

        let err = plugin()
            .invoke(args(&server), &Invocation::new(false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403: wrong token"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 1})))
            .mount(&server)
            .await;

        let output = plugin()
            .invoke(args(&server), &Invocation::new(false))
            .await
            .unwrap();
        assert!(output.output.contains("result score: 1"));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_response_without_score_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let err = plugin()
            .invoke(args(&server), &Invocation::new(false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unable to decode response"));
    }

    #[tokio::test]
    async fn test_files_listed_only_when_verbose() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 1})))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("solution.py"), "x = 1\n").unwrap();

        let mut value = args(&server);
        value["origin"] = json!(dir.path());
        value["patterns"] = json!(["*.py"]);

        let quiet = plugin().invoke(value.clone(), &Invocation::new(false)).await.unwrap();
        assert!(!quiet.output.contains("solution.py"));
        let loud = plugin().invoke(value, &Invocation::new(true)).await.unwrap();
        assert!(loud.output.contains("Attached files: solution.py"));
    }

    #[test]
    fn test_send_time_formats() {
        assert!(parse_send_time("2024-01-03T12:00:00+01:00").is_some());
        assert!(parse_send_time("2024-01-03 12:00:00+0300").is_some());
        assert!(parse_send_time("yesterday").is_none());
    }
}
