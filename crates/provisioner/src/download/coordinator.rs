//! Two-phase metalink download workflow.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::aria2::{Aria2Client, TaskState, TaskStatus};
use super::{DownloadError, DownloadProgress, DownloadReport, FailedTask};

/// Last known state of one subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub id: String,
    pub status: TaskState,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
}

impl DownloadTask {
    fn queued(id: String) -> Self {
        Self {
            id,
            status: TaskState::Waiting,
            completed_bytes: 0,
            total_bytes: 0,
            error: None,
        }
    }

    fn from_status(status: TaskStatus) -> Self {
        let error = match (status.error_code, status.error_message) {
            (_, Some(message)) if !message.is_empty() => Some(message),
            (Some(code), _) => Some(format!("aria2 error code {code}")),
            _ => None,
        };
        Self {
            id: status.gid,
            status: status.status,
            completed_bytes: status.completed_length,
            total_bytes: status.total_length,
            error,
        }
    }
}

/// Where the workflow is.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadState {
    /// Waiting for aria2 to fetch and expand the metalink.
    Expanding { meta_gid: String },
    /// Polling the subtasks the metalink expanded into.
    Transferring {
        pending: BTreeMap<String, DownloadTask>,
        completed: BTreeMap<String, DownloadTask>,
        failed: BTreeMap<String, DownloadTask>,
    },
    /// Every subtask settled, or the run was cancelled.
    Finished(DownloadReport),
}

/// A metalink download driven one polling round at a time.
#[derive(Debug)]
pub struct MetalinkDownload {
    client: Arc<Aria2Client>,
    state: DownloadState,
}

impl MetalinkDownload {
    /// Submit `metalink_url` and start in the expanding state.
    ///
    /// # Errors
    /// Returns error if aria2 rejects the submission.
    pub async fn start(
        client: Arc<Aria2Client>,
        metalink_url: &str,
        dir: Option<&str>,
    ) -> Result<Self, DownloadError> {
        let meta_gid = client.add_uri(metalink_url, dir).await?;
        info!(url = %metalink_url, gid = %meta_gid, "Submitted metalink");
        Ok(Self {
            client,
            state: DownloadState::Expanding { meta_gid },
        })
    }

    /// Resume tracking an already expanded set of subtasks.
    #[must_use]
    pub fn from_subtasks(client: Arc<Aria2Client>, gids: Vec<String>) -> Self {
        Self {
            client,
            state: transferring(gids),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    /// Aggregate of the current state.
    #[must_use]
    pub fn progress(&self) -> DownloadProgress {
        match &self.state {
            DownloadState::Expanding { .. } => DownloadProgress::default(),
            DownloadState::Transferring {
                pending,
                completed,
                failed,
            } => aggregate(pending, completed, failed),
            DownloadState::Finished(report) => report.progress,
        }
    }

    /// Advance one polling round.
    ///
    /// # Errors
    /// Returns [`DownloadError::MetalinkFailed`] if expansion fails, or the RPC error.
    pub async fn poll(&mut self) -> Result<DownloadProgress, DownloadError> {
        match &mut self.state {
            DownloadState::Expanding { meta_gid } => {
                let status = self.client.tell_status(meta_gid).await?;
                match status.status {
                    TaskState::Complete if status.followed_by.is_empty() => {
                        info!(gid = %status.gid, "Metalink expanded to nothing");
                        self.state = DownloadState::Finished(DownloadReport {
                            success: true,
                            cancelled: false,
                            completed: Vec::new(),
                            failed: Vec::new(),
                            progress: DownloadProgress {
                                percent: 100.0,
                                expanded: true,
                                ..DownloadProgress::default()
                            },
                        });
                    }
                    TaskState::Complete => {
                        info!(gid = %status.gid, tasks = status.followed_by.len(), "Metalink expanded");
                        self.state = transferring(status.followed_by);
                    }
                    TaskState::Error | TaskState::Removed => {
                        let task = DownloadTask::from_status(status);
                        return Err(DownloadError::MetalinkFailed {
                            gid: task.id,
                            message: task.error.unwrap_or_else(|| "removed".into()),
                        });
                    }
                    _ => debug!(gid = %meta_gid, "Metalink still expanding"),
                }
            }
            DownloadState::Transferring {
                pending,
                completed,
                failed,
            } => {
                let gids: Vec<String> = pending.keys().cloned().collect();
                let results = self.client.multicall(&gids).await?;
                for (gid, result) in gids.into_iter().zip(results) {
                    let task = match result {
                        Ok(status) => DownloadTask::from_status(status),
                        Err(e) => {
                            // Unknown to aria2: keep last counts, mark failed.
                            let mut task = pending.remove(&gid).unwrap_or_else(|| DownloadTask::queued(gid.clone()));
                            task.status = TaskState::Removed;
                            task.error = Some(e.to_string());
                            task
                        }
                    };
                    match task.status {
                        TaskState::Complete => {
                            pending.remove(&gid);
                            completed.insert(gid, task);
                        }
                        TaskState::Error | TaskState::Removed => {
                            pending.remove(&gid);
                            warn!(gid = %gid, error = ?task.error, "Download subtask failed");
                            failed.insert(gid, task);
                        }
                        _ => {
                            pending.insert(gid, task);
                        }
                    }
                }

                if pending.is_empty() {
                    let progress = aggregate(pending, completed, failed);
                    self.state = DownloadState::Finished(report(completed, failed, progress, false));
                }
            }
            DownloadState::Finished(_) => {}
        }
        Ok(self.progress())
    }

    /// Remove every pending subtask and finish as cancelled.
    pub async fn cancel(&mut self) -> DownloadReport {
        let report = match &self.state {
            DownloadState::Expanding { meta_gid } => {
                if let Err(e) = self.client.force_remove(meta_gid).await {
                    warn!(gid = %meta_gid, error = %e, "Failed to remove metalink task");
                }
                report(&BTreeMap::new(), &BTreeMap::new(), DownloadProgress::default(), true)
            }
            DownloadState::Transferring {
                pending,
                completed,
                failed,
            } => {
                for gid in pending.keys() {
                    if let Err(e) = self.client.force_remove(gid).await {
                        warn!(gid = %gid, error = %e, "Failed to remove download subtask");
                    }
                }
                report(completed, failed, aggregate(pending, completed, failed), true)
            }
            DownloadState::Finished(report) => return report.clone(),
        };
        info!(completed = report.completed.len(), "Download cancelled");
        self.state = DownloadState::Finished(report.clone());
        report
    }

    /// Poll every `interval` until finished. `on_progress` runs after each
    /// round; returning `false` cancels the download.
    ///
    /// # Errors
    /// Returns error if a poll fails.
    pub async fn run<F>(
        &mut self,
        interval: Duration,
        mut on_progress: F,
    ) -> Result<DownloadReport, DownloadError>
    where
        F: FnMut(&DownloadProgress) -> bool + Send,
    {
        loop {
            let progress = self.poll().await?;
            let keep_going = on_progress(&progress);
            if let DownloadState::Finished(report) = &self.state {
                return Ok(report.clone());
            }
            if !keep_going {
                return Ok(self.cancel().await);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn transferring(gids: Vec<String>) -> DownloadState {
    DownloadState::Transferring {
        pending: gids
            .into_iter()
            .map(|gid| (gid.clone(), DownloadTask::queued(gid)))
            .collect(),
        completed: BTreeMap::new(),
        failed: BTreeMap::new(),
    }
}

fn aggregate(
    pending: &BTreeMap<String, DownloadTask>,
    completed: &BTreeMap<String, DownloadTask>,
    failed: &BTreeMap<String, DownloadTask>,
) -> DownloadProgress {
    let all = || pending.values().chain(completed.values()).chain(failed.values());
    let total_bytes: u64 = all().map(|t| t.total_bytes).sum();
    let completed_bytes: u64 = all().map(|t| t.completed_bytes).sum();
    let total_count = pending.len() + completed.len() + failed.len();

    #[allow(clippy::cast_precision_loss)]
    let percent = if total_bytes > 0 {
        completed_bytes as f64 * 100.0 / total_bytes as f64
    } else if pending.is_empty() {
        100.0
    } else {
        0.0
    };

    DownloadProgress {
        percent,
        completed_count: completed.len(),
        failed_count: failed.len(),
        pending_count: pending.len(),
        total_count,
        completed_bytes,
        total_bytes,
        expanded: true,
    }
}

fn report(
    completed: &BTreeMap<String, DownloadTask>,
    failed: &BTreeMap<String, DownloadTask>,
    progress: DownloadProgress,
    cancelled: bool,
) -> DownloadReport {
    DownloadReport {
        success: failed.is_empty() && !cancelled,
        cancelled,
        completed: completed.keys().cloned().collect(),
        failed: failed
            .values()
            .map(|t| FailedTask {
                gid: t.id.clone(),
                message: t.error.clone().unwrap_or_default(),
            })
            .collect(),
        progress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorKind};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc(result: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"id": "1", "jsonrpc": "2.0", "result": result}))
    }

    fn status(gid: &str, state: &str, total: u64, done: u64) -> serde_json::Value {
        json!({
            "gid": gid,
            "status": state,
            "totalLength": total.to_string(),
            "completedLength": done.to_string(),
        })
    }

    async fn mount_meta(server: &MockServer, meta: serde_json::Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "aria2.addUri"})))
            .respond_with(rpc(json!("meta")))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "aria2.tellStatus"})))
            .respond_with(rpc(meta))
            .mount(server)
            .await;
    }

    async fn start(server: &MockServer) -> MetalinkDownload {
        let client = Arc::new(Aria2Client::new(&format!("{}/jsonrpc", server.uri()), None).unwrap());
        MetalinkDownload::start(client, "http://repo/bundle.metalink", Some("/data"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_aggregate_counts_pending_and_settled() {
        let server = MockServer::start().await;
        let mut meta = status("meta", "complete", 0, 0);
        meta["followedBy"] = json!(["a1", "a2"]);
        mount_meta(&server, meta).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "system.multicall"})))
            .respond_with(rpc(json!([
                [status("a1", "active", 100, 50)],
                [status("a2", "complete", 300, 300)],
            ])))
            .mount(&server)
            .await;

        let mut download = start(&server).await;
        download.poll().await.unwrap();
        assert!(matches!(download.state(), DownloadState::Transferring { .. }));

        let progress = download.poll().await.unwrap();
        assert!((progress.percent - 87.5).abs() < 1e-9);
        assert_eq!(progress.completed_count, 1);
        assert_eq!(progress.pending_count, 1);
        assert_eq!(progress.failed_count, 0);
        assert_eq!(progress.total_count, 2);
        assert!(!progress.is_settled());
    }

    #[tokio::test]
    async fn test_empty_expansion_succeeds_immediately() {
        let server = MockServer::start().await;
        mount_meta(&server, status("meta", "complete", 0, 0)).await;

        let mut download = start(&server).await;
        let report = download
            .run(Duration::from_millis(10), |_| true)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.progress.total_count, 0);
        assert!(report.progress.is_settled());
    }

    #[tokio::test]
    async fn test_expansion_error_fails_whole_download() {
        let server = MockServer::start().await;
        let mut meta = status("meta", "error", 0, 0);
        meta["errorCode"] = json!("3");
        meta["errorMessage"] = json!("Resource not found");
        mount_meta(&server, meta).await;

        let mut download = start(&server).await;
        let err = download.poll().await.unwrap_err();
        assert!(matches!(err, DownloadError::MetalinkFailed { ref message, .. } if message == "Resource not found"));
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[tokio::test]
    async fn test_failed_subtask_makes_report_unsuccessful() {
        let server = MockServer::start().await;
        let mut meta = status("meta", "complete", 0, 0);
        meta["followedBy"] = json!(["a1", "a2"]);
        mount_meta(&server, meta).await;
        let mut failed = status("a2", "error", 300, 10);
        failed["errorMessage"] = json!("checksum mismatch");
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "system.multicall"})))
            .respond_with(rpc(json!([[status("a1", "complete", 100, 100)], [failed]])))
            .mount(&server)
            .await;

        let mut download = start(&server).await;
        let mut rounds = 0;
        let report = download
            .run(Duration::from_millis(10), |_| {
                rounds += 1;
                true
            })
            .await
            .unwrap();

        assert_eq!(rounds, 2);
        assert!(!report.success);
        assert_eq!(report.completed, vec!["a1"]);
        assert_eq!(
            report.failed,
            vec![FailedTask {
                gid: "a2".into(),
                message: "checksum mismatch".into()
            }]
        );
        assert!(report.progress.is_settled());
    }

    #[tokio::test]
    async fn test_callback_false_cancels_pending() {
        let server = MockServer::start().await;
        let mut meta = status("meta", "complete", 0, 0);
        meta["followedBy"] = json!(["a1"]);
        mount_meta(&server, meta).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "system.multicall"})))
            .respond_with(rpc(json!([[status("a1", "active", 100, 5)]])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "aria2.forceRemove", "params": ["a1"]})))
            .respond_with(rpc(json!("a1")))
            .expect(1)
            .mount(&server)
            .await;

        let mut download = start(&server).await;
        download.poll().await.unwrap();
        let report = download
            .run(Duration::from_millis(10), |_| false)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(!report.success);
        assert_eq!(report.progress.pending_count, 1);
        assert!(matches!(download.state(), DownloadState::Finished(_)));
    }
}
