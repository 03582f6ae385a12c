//! Command surface over stdin/stdout.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{
    BackupArgs, ContainerRef, DispatchArgs, FindArgs, GetArgs, MergeLayerArgs, NicAddArgs,
    NicRemoveArgs, PortForwardArgs, Request, Response, RestoreArgs, ResultArgs,
};
use crate::container::ContainerArgs;
use crate::error::{ErrorKind, ManagerError, ServerError};
use crate::manager::Manager;

/// Names accepted in `Request::command`.
pub const COMMANDS: &[&str] = &[
    "create",
    "create-sync",
    "dispatch",
    "dispatch-sync",
    "result",
    "terminate",
    "nic-add",
    "nic-remove",
    "portforward-add",
    "portforward-remove",
    "find",
    "list",
    "get",
    "backup",
    "restore",
    "merge-layer",
    "overlay-info",
    "overlay-list",
];

fn arguments<T: DeserializeOwned>(value: &Value) -> Result<T, ManagerError> {
    serde_json::from_value(value.clone())
        .map_err(|e| ManagerError::InvalidArguments(format!("invalid arguments: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ManagerError> {
    serde_json::to_value(value)
        .map_err(|e| ManagerError::InvalidArguments(format!("failed to encode result: {e}")))
}

/// Runs one request against `manager`, blocking until it completes.
///
/// # Errors
///
/// Returns `ManagerError::InvalidArguments` for unknown commands or
/// malformed arguments, otherwise the manager's error.
pub fn execute(manager: &Manager, request: &Request) -> Result<Value, ManagerError> {
    let args = &request.arguments;
    match request.command.as_str() {
        "create" => to_value(&manager.create(arguments::<ContainerArgs>(args)?)?),
        "create-sync" => to_value(&manager.create_sync(arguments::<ContainerArgs>(args)?)?),
        "dispatch" => {
            let DispatchArgs { container, command } = arguments(args)?;
            to_value(&manager.dispatch(container, command)?)
        }
        "dispatch-sync" => {
            let DispatchArgs { container, command } = arguments(args)?;
            to_value(&manager.dispatch_sync(container, command)?)
        }
        "result" => {
            let ResultArgs { id, timeout } = arguments(args)?;
            let timeout = timeout.map_or(manager.config().result_timeout, Duration::from_secs);
            to_value(&manager.result(&id, timeout)?)
        }
        "terminate" => {
            let ContainerRef { container } = arguments(args)?;
            manager.terminate(container)?;
            Ok(Value::Null)
        }
        "nic-add" => {
            let NicAddArgs { container, nic } = arguments(args)?;
            manager.nic_add(container, nic)?;
            Ok(Value::Null)
        }
        "nic-remove" => {
            let NicRemoveArgs { container, index } = arguments(args)?;
            manager.nic_remove(container, index)?;
            Ok(Value::Null)
        }
        "portforward-add" => {
            let forward: PortForwardArgs = arguments(args)?;
            manager.portforward_add(forward.container, &forward.host_port, forward.container_port)?;
            Ok(Value::Null)
        }
        "portforward-remove" => {
            let forward: PortForwardArgs = arguments(args)?;
            manager.portforward_remove(
                forward.container,
                &forward.host_port,
                forward.container_port,
            )?;
            Ok(Value::Null)
        }
        "find" => {
            let FindArgs { tags } = if args.is_null() {
                FindArgs::default()
            } else {
                arguments(args)?
            };
            to_value(&manager.find(&tags))
        }
        "list" => to_value(&manager.list()),
        "get" => {
            let GetArgs { query } = arguments(args)?;
            to_value(&manager.get(&query)?)
        }
        "backup" => {
            let backup: BackupArgs = arguments(args)?;
            to_value(&manager.backup(backup.container, &backup.url, &backup.tags)?)
        }
        "restore" => {
            let RestoreArgs { url, tags } = arguments(args)?;
            to_value(&manager.restore(&url, tags)?)
        }
        "merge-layer" => {
            let MergeLayerArgs { container, flist } = arguments(args)?;
            manager.merge_layer(container, &flist)?;
            Ok(Value::Null)
        }
        "overlay-info" => {
            let ContainerRef { container } = arguments(args)?;
            manager.overlay_info(container)
        }
        "overlay-list" => {
            let ContainerRef { container } = arguments(args)?;
            manager.overlay_list(container)
        }
        other => Err(ManagerError::InvalidArguments(format!(
            "unknown command '{other}'"
        ))),
    }
}

/// Parses one request line and runs it on the blocking pool.
async fn respond(manager: Manager, line: String) -> Response {
    let request: Request = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed request line");
            return Response::failure(
                Value::Null,
                ErrorKind::BadRequest,
                ServerError::InvalidRequest(e.to_string()).to_string(),
            );
        }
    };

    let id = request.id.clone();
    debug!(command = %request.command, "Request received");
    let outcome = tokio::task::spawn_blocking(move || execute(&manager, &request)).await;
    match outcome {
        Ok(Ok(data)) => Response::success(id, data),
        Ok(Err(e)) => {
            debug!(kind = %e.kind(), error = %e.chain(), "Request failed");
            Response::from_error(id, &e)
        }
        Err(e) => Response::failure(id, ErrorKind::Internal, format!("request panicked: {e}")),
    }
}

/// Serves requests from stdin until it is closed.
///
/// Requests run concurrently; each response carries the id of its request.
///
/// # Errors
///
/// Returns `ServerError::Transport` if stdin or stdout fail.
pub async fn run(manager: Manager) -> crate::error::Result<()> {
    info!("Serving commands on stdin");
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_vec(&response) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode response");
                    continue;
                }
            };
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = tokio::task::JoinSet::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ServerError::Transport(e.to_string()))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let manager = manager.clone();
        let tx = tx.clone();
        pending.spawn(async move {
            let response = respond(manager, line).await;
            let _ = tx.send(response);
        });
    }

    debug!("Stdin closed, draining requests");
    while pending.join_next().await.is_some() {}
    drop(tx);

    writer
        .await
        .map_err(|e| ServerError::Transport(e.to_string()))?
        .map_err(|e| ServerError::Transport(e.to_string()))?;
    info!("Command server stopped");
    Ok(())
}
