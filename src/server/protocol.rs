//! Request and response records of the command surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::container::Nic;
use crate::error::{ErrorKind, ManagerError};
use crate::relay::Command;

/// One request line.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Caller-chosen id echoed in the response.
    #[serde(default)]
    pub id: Value,
    /// Command name, e.g. `create` or `nic-add`.
    pub command: String,
    /// Command-specific arguments.
    #[serde(default)]
    pub arguments: Value,
}

/// Failure description of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human readable error chain.
    pub message: String,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request.
    pub id: Value,
    /// Whether the command succeeded.
    pub ok: bool,
    /// Result of a successful command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure of an unsuccessful command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Successful response carrying `data`.
    #[must_use]
    pub fn success(id: Value, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(id: Value, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Failed response describing `error`.
    #[must_use]
    pub fn from_error(id: Value, error: &ManagerError) -> Self {
        Self::failure(id, error.kind(), error.chain())
    }
}

/// Arguments naming a container.
#[derive(Debug, Deserialize)]
pub struct ContainerRef {
    pub container: u16,
}

#[derive(Debug, Deserialize)]
pub struct DispatchArgs {
    pub container: u16,
    pub command: Command,
}

/// Correlation id of a dispatched command; `timeout` is in seconds.
#[derive(Debug, Deserialize)]
pub struct ResultArgs {
    pub id: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct NicAddArgs {
    pub container: u16,
    pub nic: Nic,
}

#[derive(Debug, Deserialize)]
pub struct NicRemoveArgs {
    pub container: u16,
    pub index: usize,
}

#[derive(Debug, Deserialize)]
pub struct PortForwardArgs {
    pub container: u16,
    pub host_port: String,
    pub container_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct MergeLayerArgs {
    pub container: u16,
    pub flist: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FindArgs {
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetArgs {
    pub query: Value,
}

#[derive(Debug, Deserialize)]
pub struct BackupArgs {
    pub container: u16,
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreArgs {
    pub url: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: Request =
            serde_json::from_str(r#"{"command":"list"}"#).expect("decode");
        assert_eq!(request.id, Value::Null);
        assert_eq!(request.arguments, Value::Null);
    }

    #[test]
    fn test_failure_shape() {
        let response = Response::failure(json!(7), ErrorKind::NotFound, "container 3 not found");
        assert_eq!(
            serde_json::to_value(&response).expect("encode"),
            json!({
                "id": 7,
                "ok": false,
                "error": {"kind": "not-found", "message": "container 3 not found"}
            })
        );
    }

    #[test]
    fn test_success_omits_error() {
        let response = Response::success(json!("a"), json!(1));
        assert_eq!(
            serde_json::to_value(&response).expect("encode"),
            json!({"id": "a", "ok": true, "data": 1})
        );
    }
}
