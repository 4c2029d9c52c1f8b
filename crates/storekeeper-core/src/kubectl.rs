//! Cluster inspector backed by the `kubectl` binary.
//!
//! All reads go through `-o json` and are parsed with serde; the only write
//! is namespace deletion, the backstop of the delete workflow. Commands run
//! under a short timeout so a wedged API server cannot stall a workflow
//! indefinitely.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::config::Config;
use crate::deploy::{pods_ready, ClusterError, ClusterEvent, ClusterInspector, PodStatus};

/// Default per-command timeout for cluster tool invocations.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// `kubectl` CLI wrapper.
pub struct KubectlClient {
    timeout: Duration,
    kubeconfig: Option<PathBuf>,
}

impl KubectlClient {
    /// Creates a client with an explicit command timeout.
    #[must_use]
    pub const fn new(timeout: Duration, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            timeout,
            kubeconfig,
        }
    }

    /// Creates a client from configuration with the default timeout.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT, config.kubeconfig.clone())
    }

    async fn run<I, S>(&self, args: I) -> Result<std::process::Output, ClusterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new("kubectl");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kubeconfig);
        }

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => Err(ClusterError::TimedOut(self.timeout)),
            Ok(Err(e)) => {
                let message = format!("failed to run kubectl: {e}");
                Err(ClusterError::Io { message, source: e })
            }
            Ok(Ok(output)) => Ok(output),
        }
    }

    async fn get_json<I, S>(&self, args: I) -> Result<String, ClusterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(ClusterError::Failed(stderr_text(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ClusterInspector for KubectlClient {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError> {
        let output = self
            .run(["get", "namespace", namespace, "-o", "name"])
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let text = stderr_text(&output);
        if text.contains("NotFound") {
            return Ok(false);
        }
        Err(ClusterError::Failed(text))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        if !self.namespace_exists(namespace).await? {
            return Ok(());
        }
        let output = self
            .run(["delete", "namespace", namespace, "--wait=true"])
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let text = stderr_text(&output);
        // Deleted out from under us between the check and the delete.
        if text.contains("NotFound") {
            return Ok(());
        }
        Err(ClusterError::Failed(text))
    }

    async fn pod_statuses(&self, namespace: &str) -> Result<Vec<PodStatus>, ClusterError> {
        let json = self
            .get_json(["get", "pods", "--namespace", namespace, "-o", "json"])
            .await?;
        parse_pod_list(&json)
    }

    async fn all_pods_ready(&self, namespace: &str) -> Result<bool, ClusterError> {
        let pods = self.pod_statuses(namespace).await?;
        Ok(pods_ready(&pods))
    }

    async fn job_completed(&self, namespace: &str, job: &str) -> Result<bool, ClusterError> {
        let json = self
            .get_json(["get", "job", job, "--namespace", namespace, "-o", "json"])
            .await?;
        parse_job_condition(&json, "Complete")
    }

    async fn job_failed(&self, namespace: &str, job: &str) -> Result<bool, ClusterError> {
        let json = self
            .get_json(["get", "job", job, "--namespace", namespace, "-o", "json"])
            .await?;
        parse_job_condition(&json, "Failed")
    }

    async fn events(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<ClusterEvent>, ClusterError> {
        let json = self
            .get_json([
                "get",
                "events",
                "--namespace",
                namespace,
                "--sort-by=.lastTimestamp",
                "-o",
                "json",
            ])
            .await?;
        parse_event_list(&json, limit)
    }
}

fn stderr_text(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Deserialize)]
struct PodItem {
    metadata: ObjectMeta,
    #[serde(default)]
    status: RawPodStatus,
}

#[derive(Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
}

#[derive(Default, Deserialize)]
struct RawPodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    conditions: Vec<RawCondition>,
    #[serde(rename = "containerStatuses", default)]
    container_statuses: Vec<RawContainerStatus>,
}

#[derive(Deserialize)]
struct RawCondition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct RawContainerStatus {
    #[serde(rename = "restartCount", default)]
    restart_count: u32,
}

/// Parses `kubectl get pods -o json` output into pod status snapshots.
fn parse_pod_list(json: &str) -> Result<Vec<PodStatus>, ClusterError> {
    let list: PodList =
        serde_json::from_str(json).map_err(|e| ClusterError::Parse(e.to_string()))?;
    Ok(list
        .items
        .into_iter()
        .map(|item| {
            let ready = item
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True");
            let restarts = item
                .status
                .container_statuses
                .iter()
                .map(|c| c.restart_count)
                .max()
                .unwrap_or(0);
            PodStatus {
                name: item.metadata.name,
                phase: item.status.phase,
                ready,
                restarts,
            }
        })
        .collect())
}

#[derive(Deserialize)]
struct JobItem {
    #[serde(default)]
    status: RawJobStatus,
}

#[derive(Default, Deserialize)]
struct RawJobStatus {
    #[serde(default)]
    conditions: Vec<RawCondition>,
}

/// Checks a job's completion conditions for the given type with status True.
fn parse_job_condition(json: &str, kind: &str) -> Result<bool, ClusterError> {
    let job: JobItem =
        serde_json::from_str(json).map_err(|e| ClusterError::Parse(e.to_string()))?;
    Ok(job
        .status
        .conditions
        .iter()
        .any(|c| c.kind == kind && c.status == "True"))
}

#[derive(Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<EventItem>,
}

#[derive(Deserialize)]
struct EventItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
    #[serde(rename = "involvedObject", default)]
    involved_object: InvolvedObject,
    #[serde(rename = "lastTimestamp", default)]
    last_timestamp: Option<String>,
}

#[derive(Default, Deserialize)]
struct InvolvedObject {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    name: String,
}

/// Parses event output, keeping the `limit` most recent entries, newest
/// last (the input is sorted ascending by `lastTimestamp`).
fn parse_event_list(json: &str, limit: usize) -> Result<Vec<ClusterEvent>, ClusterError> {
    let list: EventList =
        serde_json::from_str(json).map_err(|e| ClusterError::Parse(e.to_string()))?;
    let skip = list.items.len().saturating_sub(limit);
    Ok(list
        .items
        .into_iter()
        .skip(skip)
        .map(|item| ClusterEvent {
            kind: item.kind,
            reason: item.reason,
            message: item.message,
            object: format!(
                "{}/{}",
                item.involved_object.kind, item.involved_object.name
            ),
            timestamp: item.last_timestamp.as_deref().and_then(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const POD_JSON: &str = r#"{
        "items": [
            {
                "metadata": {"name": "wordpress-0"},
                "status": {
                    "phase": "Running",
                    "conditions": [
                        {"type": "Initialized", "status": "True"},
                        {"type": "Ready", "status": "True"}
                    ],
                    "containerStatuses": [
                        {"restartCount": 0},
                        {"restartCount": 2}
                    ]
                }
            },
            {
                "metadata": {"name": "mysql-0"},
                "status": {
                    "phase": "Pending",
                    "conditions": [{"type": "Ready", "status": "False"}],
                    "containerStatuses": [{"restartCount": 7}]
                }
            },
            {
                "metadata": {"name": "init-db"},
                "status": {"phase": "Succeeded"}
            }
        ]
    }"#;

    #[test]
    fn parse_pods() {
        let pods = parse_pod_list(POD_JSON).unwrap();
        assert_eq!(pods.len(), 3);

        assert_eq!(pods[0].name, "wordpress-0");
        assert!(pods[0].ready);
        assert_eq!(pods[0].restarts, 2);

        assert_eq!(pods[1].name, "mysql-0");
        assert!(!pods[1].ready);
        assert!(pods[1].failing());

        assert!(pods[2].succeeded());
    }

    #[test]
    fn parse_empty_pod_list() {
        let pods = parse_pod_list(r#"{"items": []}"#).unwrap();
        assert!(pods.is_empty());
        assert!(!pods_ready(&pods));
    }

    #[test]
    fn parse_pods_rejects_garbage() {
        assert!(matches!(
            parse_pod_list("not json"),
            Err(ClusterError::Parse(_))
        ));
    }

    #[test]
    fn job_conditions() {
        let json = r#"{
            "status": {
                "conditions": [
                    {"type": "Complete", "status": "True"}
                ]
            }
        }"#;
        assert!(parse_job_condition(json, "Complete").unwrap());
        assert!(!parse_job_condition(json, "Failed").unwrap());

        let json = r#"{"status": {}}"#;
        assert!(!parse_job_condition(json, "Complete").unwrap());
    }

    #[test]
    fn events_keep_tail_newest_last() {
        let json = r#"{
            "items": [
                {"type": "Normal", "reason": "Scheduled", "message": "one",
                 "involvedObject": {"kind": "Pod", "name": "a"}},
                {"type": "Warning", "reason": "BackOff", "message": "two",
                 "involvedObject": {"kind": "Pod", "name": "b"},
                 "lastTimestamp": "2024-06-01T12:00:00Z"},
                {"type": "Warning", "reason": "Failed", "message": "three",
                 "involvedObject": {"kind": "Pod", "name": "c"}}
            ]
        }"#;
        let events = parse_event_list(json, 2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, "BackOff");
        assert_eq!(events[1].reason, "Failed");
        assert_eq!(events[0].object, "Pod/b");
        assert!(events[0].timestamp.is_some());
        assert!(events[1].timestamp.is_none());
    }
}
