use crate::core::config::McpServerConfig;
use crate::mcp::transport::{connectivity, McpTransport, MCP_METHOD_NOT_FOUND};
use crate::mcp::McpError;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{RequestId, RpcError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

const STDIO_WRITE_TIMEOUT_SECONDS: u64 = 10;

type PendingRequests = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

/// A locally spawned MCP server speaking newline-delimited JSON-RPC.
///
/// The child process is killed when the transport is dropped.
pub struct StdioTransport {
    server_id: String,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingRequests,
    next_request_id: AtomicI64,
    request_timeout: Duration,
    _child: std::sync::Mutex<Child>,
}

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig, request_timeout: Duration) -> Result<Self, McpError> {
        let command = config.command.clone().ok_or_else(|| {
            McpError::Config(format!(
                "MCP command is required for stdio transport (server {}).",
                config.id
            ))
        })?;
        let args = config.args.clone().unwrap_or_default();
        debug!(server_id = %config.id, command = %command, args = ?args, "Starting MCP stdio server");

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &config.env {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| connectivity(&config.id, format!("failed to start `{command}`: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connectivity(&config.id, "Unable to retrieve stdin."))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connectivity(&config.id, "Unable to retrieve stdout."))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| connectivity(&config.id, "Unable to retrieve stderr."))?;

        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let stdin = Arc::new(Mutex::new(stdin));
        Self::spawn_stdout_reader(
            config.id.clone(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&stdin),
        );
        Self::spawn_stderr_drain(config.id.clone(), stderr);

        Ok(Self {
            server_id: config.id.clone(),
            stdin,
            pending,
            next_request_id: AtomicI64::new(0),
            request_timeout,
            _child: std::sync::Mutex::new(child),
        })
    }

    fn spawn_stdout_reader(
        server_id: String,
        stdout: tokio::process::ChildStdout,
        pending: PendingRequests,
        stdin: Arc<Mutex<ChildStdin>>,
    ) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let value = match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => value,
                    Err(_) => {
                        debug!(server_id = %server_id, "Skipping non-JSON line from MCP stdio server");
                        continue;
                    }
                };
                let items = match value {
                    serde_json::Value::Array(items) => items,
                    other => vec![other],
                };
                for item in items {
                    if let Ok(message) = serde_json::from_value::<ServerMessage>(item) {
                        Self::dispatch_message(&server_id, &pending, &stdin, message).await;
                    }
                }
            }
            debug!(server_id = %server_id, "MCP stdio server closed stdout");
            // Dropping the senders fails every request still waiting.
            pending.lock().await.clear();
        });
    }

    fn spawn_stderr_drain(server_id: String, stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(server_id = %server_id, stderr = %line, "MCP stdio server stderr");
            }
        });
    }

    async fn dispatch_message(
        server_id: &str,
        pending: &PendingRequests,
        stdin: &Mutex<ChildStdin>,
        message: ServerMessage,
    ) {
        match &message {
            ServerMessage::Response(response) => {
                debug!(server_id = %server_id, response_id = ?response.id, "Received MCP stdio response");
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                debug!(
                    server_id = %server_id,
                    error_id = ?error.id,
                    error_code = error.error.code,
                    "Received MCP stdio error"
                );
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                // Server-initiated requests (sampling, elicitation) are not offered.
                debug!(server_id = %server_id, method = %request.method(), "Declining MCP server request");
                let error = RpcError {
                    code: MCP_METHOD_NOT_FOUND,
                    message: format!("Client does not support {}", request.method()),
                    data: None,
                };
                let reply = ClientMessage::from_message(
                    MessageFromClient::Error(error),
                    Some(request.request_id().clone()),
                );
                if let Ok(reply) = reply {
                    let _ = write_line(stdin, &reply).await;
                }
            }
            ServerMessage::Notification(_) => {
                debug!(server_id = %server_id, "Received MCP stdio notification");
            }
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }
}

async fn write_line(stdin: &Mutex<ChildStdin>, message: &ClientMessage) -> Result<(), String> {
    let payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
    let write_timeout = Duration::from_secs(STDIO_WRITE_TIMEOUT_SECONDS);
    let mut stdin = tokio::time::timeout(write_timeout, stdin.lock())
        .await
        .map_err(|_| "Timed out waiting for MCP stdio stdin lock.".to_string())?;
    let mut line = payload.into_bytes();
    line.push(b'\n');
    tokio::time::timeout(write_timeout, stdin.write_all(&line))
        .await
        .map_err(|_| "Timed out writing MCP stdio message.".to_string())?
        .map_err(|err| err.to_string())?;
    tokio::time::timeout(write_timeout, stdin.flush())
        .await
        .map_err(|_| "Timed out flushing MCP stdio message.".to_string())?
        .map_err(|err| err.to_string())
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let request_id = self.next_request_id();
        debug!(server_id = %self.server_id, request_id = ?request_id, "Sending MCP stdio request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| connectivity(&self.server_id, err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(err) = write_line(&self.stdin, &message).await {
            self.pending.lock().await.remove(&request_id);
            return Err(connectivity(&self.server_id, err));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(connectivity(
                &self.server_id,
                "MCP stdio server exited before responding.",
            )),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                debug!(
                    server_id = %self.server_id,
                    request_id = ?request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "MCP stdio request timed out"
                );
                Err(connectivity(&self.server_id, "MCP stdio request timed out."))
            }
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| connectivity(&self.server_id, err.to_string()))?;
        write_line(&self.stdin, &message)
            .await
            .map_err(|err| connectivity(&self.server_id, err))
    }
}
