//! HTTP client for the aitaskd daemon.

use aitask_core::{BackendKind, QuotaState, Runner, Task, TaskStatus, Workspace};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not reachable at {addr}\n  -> start it with: aitaskd\n  -> or set AITASKD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::Http {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Error body shape returned by the daemon.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub prompt: String,
    pub workspace_id: i64,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateWorkspaceRequest {
    pub path: String,
    pub display_name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogSnapshot {
    pub run_id: i64,
    pub exit_code: Option<i32>,
    pub log_blob: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettingsBody {
    pub workspace_max_parallel: u32,
}

/// One parsed SSE frame from the log stream.
#[derive(Debug)]
pub struct StreamFrame {
    pub event: String,
    pub data: String,
}

/// HTTP client for aitaskd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.detail,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
        };
        Err(ClientError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let mut request = self.http.post(format!("{}{path}", self.base_url));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    // --- Tasks ---

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        workspace_id: Option<i64>,
    ) -> Result<Vec<Task>> {
        let mut query = Vec::new();
        if let Some(status) = status {
            query.push(format!("status={}", status.as_str()));
        }
        if let Some(ws) = workspace_id {
            query.push(format!("workspace_id={ws}"));
        }
        let suffix = if query.is_empty() {
            String::new()
        } else {
            format!("?{}", query.join("&"))
        };
        self.get_json(&format!("/api/tasks{suffix}")).await
    }

    pub async fn create_task(&self, req: &CreateTaskRequest) -> Result<Task> {
        self.post_json("/api/tasks", Some(req)).await
    }

    pub async fn get_task(&self, id: i64) -> Result<Task> {
        self.get_json(&format!("/api/tasks/{id}")).await
    }

    pub async fn cancel_task(&self, id: i64) -> Result<serde_json::Value> {
        self.post_json::<(), _>(&format!("/api/tasks/{id}/cancel"), None)
            .await
    }

    pub async fn retry_task(&self, id: i64) -> Result<Task> {
        self.post_json::<(), _>(&format!("/api/tasks/{id}/retry"), None)
            .await
    }

    pub async fn continue_task(
        &self,
        id: i64,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<Task> {
        let body = serde_json::json!({ "prompt": prompt, "model": model });
        self.post_json(&format!("/api/tasks/{id}/continue"), Some(&body))
            .await
    }

    pub async fn merge_task(&self, id: i64) -> Result<Task> {
        self.post_json::<(), _>(&format!("/api/tasks/{id}/merge"), None)
            .await
    }

    pub async fn mark_task_done(&self, id: i64) -> Result<Task> {
        self.post_json::<(), _>(&format!("/api/tasks/{id}/mark-done"), None)
            .await
    }

    pub async fn delete_task(&self, id: i64) -> Result<serde_json::Value> {
        let response = self
            .http
            .delete(format!("{}/api/tasks/{id}", self.base_url))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    // --- Workspaces / runners / quota / settings ---

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.get_json("/api/workspaces").await
    }

    pub async fn create_workspace(&self, req: &CreateWorkspaceRequest) -> Result<Workspace> {
        self.post_json("/api/workspaces", Some(req)).await
    }

    pub async fn list_runners(&self) -> Result<Vec<Runner>> {
        self.get_json("/api/runners").await
    }

    pub async fn list_quota_states(&self) -> Result<Vec<QuotaState>> {
        self.get_json("/api/quota").await
    }

    pub async fn get_settings(&self) -> Result<SettingsBody> {
        self.get_json("/api/settings").await
    }

    pub async fn put_settings(&self, workspace_max_parallel: u32) -> Result<SettingsBody> {
        let body = SettingsBody {
            workspace_max_parallel,
        };
        let response = self
            .http
            .put(format!("{}/api/settings", self.base_url))
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    // --- Logs ---

    pub async fn get_logs(&self, run_id: i64) -> Result<LogSnapshot> {
        self.get_json(&format!("/api/logs/{run_id}")).await
    }

    /// Follow the SSE log stream, invoking `on_frame` per event. Returns
    /// when the server closes the stream (after the `complete` event).
    pub async fn follow_logs(
        &self,
        run_id: i64,
        mut on_frame: impl FnMut(StreamFrame),
    ) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/api/logs/{run_id}/stream", self.base_url))
            .send()
            .await?;
        let response = Self::check(response).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut event = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);

                if let Some(name) = line.strip_prefix("event:") {
                    event = name.trim().to_string();
                } else if let Some(data) = line.strip_prefix("data:") {
                    on_frame(StreamFrame {
                        event: if event.is_empty() {
                            "message".to_string()
                        } else {
                            event.clone()
                        },
                        data: data.trim_start().to_string(),
                    });
                } else if line.is_empty() {
                    event.clear();
                }
            }
        }
        Ok(())
    }
}
