//! `check_gitlab_merge_request`: policy checks on a merge request's labels
//! and changed files.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::plugin::{Invocation, Plugin, PluginError, PluginOutput, PluginResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeRequestArgs {
    /// GitLab base URL, e.g. `https://gitlab.example.com`.
    pub gitlab_url: String,
    /// Numeric id or `namespace/name` path.
    pub project: String,
    pub merge_request_iid: u64,
    pub token: String,
    #[serde(default)]
    pub required_labels: Vec<String>,
    #[serde(default)]
    pub forbidden_labels: Vec<String>,
    /// Globs over repository paths; empty allows any file.
    #[serde(default)]
    pub allowed_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct MergeRequestChanges {
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
struct Change {
    new_path: String,
}

#[derive(Default)]
pub struct MergeRequestPlugin {
    client: reqwest::Client,
}

impl MergeRequestPlugin {
    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str, token: &str) -> PluginResult<T> {
        let response = self
            .client
            .get(url)
            .header("PRIVATE-TOKEN", token)
            .send()
            .await
            .map_err(|e| PluginError::failed(format!("GitLab request failed: {e}"), ""))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PluginError::failed(
                format!("GitLab API returned {}: {body}", status.as_u16()),
                "",
            ));
        }
        response
            .json()
            .await
            .map_err(|e| PluginError::failed(format!("Unable to decode GitLab response: {e}"), ""))
    }
}

fn compile_globs(globs: &[String]) -> PluginResult<Vec<glob::Pattern>> {
    globs
        .iter()
        .map(|g| {
            glob::Pattern::new(g).map_err(|e| {
                PluginError::args(MergeRequestPlugin::NAME, format!("bad glob `{g}`: {e}"))
            })
        })
        .collect()
}

#[async_trait]
impl Plugin for MergeRequestPlugin {
    const NAME: &'static str = "check_gitlab_merge_request";
    type Args = MergeRequestArgs;

    async fn run(&self, args: MergeRequestArgs, invocation: &Invocation) -> PluginResult<PluginOutput> {
        let allowed = compile_globs(&args.allowed_files)?;
        let base = format!(
            "{}/api/v4/projects/{}/merge_requests/{}",
            args.gitlab_url.trim_end_matches('/'),
            args.project.replace('/', "%2F"),
            args.merge_request_iid
        );
        debug!(url = %base, "fetching merge request");

        let merge_request: MergeRequest = self.get(&base, &args.token).await?;
        let changes: MergeRequestChanges = self.get(&format!("{base}/changes"), &args.token).await?;

        let mut violations = Vec::new();
        for label in &args.required_labels {
            if !merge_request.labels.contains(label) {
                violations.push(format!("missing required label '{label}'"));
            }
        }
        for label in &args.forbidden_labels {
            if merge_request.labels.contains(label) {
                violations.push(format!("forbidden label '{label}' is set"));
            }
        }
        if !allowed.is_empty() {
            for change in &changes.changes {
                if !allowed.iter().any(|p| p.matches(&change.new_path)) {
                    violations.push(format!("file '{}' may not be changed", change.new_path));
                }
            }
        }

        let mut output = format!(
            "Merge request !{} ({}): {} labels, {} changed files",
            args.merge_request_iid,
            merge_request.state,
            merge_request.labels.len(),
            changes.changes.len()
        );
        if invocation.verbose {
            output.push_str(&format!("\n  labels: {}", merge_request.labels.join(", ")));
            for change in &changes.changes {
                output.push_str(&format!("\n  changed: {}", change.new_path));
            }
        }
        if violations.is_empty() {
            return Ok(PluginOutput::new(output));
        }
        for violation in &violations {
            output.push_str(&format!("\n- {violation}"));
        }
        Err(PluginError::failed(
            format!("{} merge request policy violations", violations.len()),
            output,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::plugin::DynPlugin;

    async fn gitlab(labels: &[&str], files: &[&str]) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/course%2Fstudent/merge_requests/7"))
            .and(header("PRIVATE-TOKEN", "glpat"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"labels": labels, "state": "opened"})),
            )
            .mount(&server)
            .await;
        let changes: Vec<_> = files.iter().map(|f| json!({"new_path": f})).collect();
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/course%2Fstudent/merge_requests/7/changes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"changes": changes})))
            .mount(&server)
            .await;
        server
    }

    fn args(server: &MockServer) -> serde_json::Value {
        json!({
            "gitlab_url": server.uri(),
            "project": "course/student",
            "merge_request_iid": 7,
            "token": "glpat",
            "required_labels": ["review"],
            "forbidden_labels": ["cheating"],
            "allowed_files": ["intro/*/*.py"],
        })
    }

    #[tokio::test]
    async fn test_clean_merge_request_passes() {
        let server = gitlab(&["review"], &["intro/hello/hello.py"]).await;
        let output = MergeRequestPlugin::default()
            .invoke(args(&server), &Invocation::new(false))
            .await
            .unwrap();
        assert!(output.output.contains("1 changed files"));
    }

    #[tokio::test]
    async fn test_violations_are_listed() {
        let server = gitlab(&["cheating"], &["intro/hello/hello.py", ".gitlab-ci.yml"]).await;
        let err = MergeRequestPlugin::default()
            .invoke(args(&server), &Invocation::new(false))
            .await
            .unwrap_err();
        let output = err.output();
        assert!(output.contains("missing required label 'review'"));
        assert!(output.contains("forbidden label 'cheating'"));
        assert!(output.contains("file '.gitlab-ci.yml' may not be changed"));
        assert!(err.to_string().starts_with("3 merge request"));
    }

    #[tokio::test]
    async fn test_api_error_fails_stage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let err = MergeRequestPlugin::default()
            .invoke(args(&server), &Invocation::new(false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
