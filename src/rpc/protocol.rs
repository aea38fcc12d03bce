//! JSON-RPC 2.0 envelopes and the error code table.
//!
//! Engine failures use one application code per [`ErrorKind`] in the
//! -32001..=-32012 range reserved for server errors, and also carry the
//! kind's name in `error.data.kind` for clients that match on strings.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{EngineError, ErrorKind};

pub const VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

const KIND_CODES: [(ErrorKind, i32); 12] = [
    (ErrorKind::NotFound, -32001),
    (ErrorKind::NameConflict, -32002),
    (ErrorKind::ImageNotFound, -32003),
    (ErrorKind::Corrupt, -32004),
    (ErrorKind::StorageUnavailable, -32005),
    (ErrorKind::StoragePermissionDenied, -32006),
    (ErrorKind::BackupInProgress, -32007),
    (ErrorKind::Cancelled, -32008),
    (ErrorKind::InjectionFailed, -32009),
    (ErrorKind::RuntimeFailure, -32010),
    (ErrorKind::InvalidRequest, -32011),
    (ErrorKind::Internal, -32012),
];

/// Wire code for an engine error kind.
pub fn error_code(kind: ErrorKind) -> i32 {
    KIND_CODES
        .iter()
        .find(|(k, _)| *k == kind)
        .map_or(INTERNAL_ERROR, |(_, code)| *code)
}

/// Inverse of [`error_code`]; `None` for protocol-level codes.
pub fn error_kind(code: i32) -> Option<ErrorKind> {
    KIND_CODES
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(kind, _)| *kind)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Absent for notifications, which get no reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Request {
    pub fn new(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn check(&self) -> Result<(), RpcError> {
        if self.jsonrpc != VERSION {
            return Err(RpcError::new(
                INVALID_REQUEST,
                format!("unsupported jsonrpc version {:?}", self.jsonrpc),
            ));
        }
        if self.method.is_empty() {
            return Err(RpcError::new(INVALID_REQUEST, "empty method name"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    pub fn ok(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                jsonrpc: VERSION.to_string(),
                result: Some(result),
                error: None,
                id,
            },
            Err(e) => Self::failed(id, RpcError::new(INTERNAL_ERROR, e.to_string())),
        }
    }

    pub fn failed(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Result or error as one value.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("parse error: {}", detail))
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("no such method: {}", method))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {}", detail))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, detail.to_string())
    }

    /// Engine kind, from the code or else from `data.kind`.
    pub fn kind(&self) -> Option<ErrorKind> {
        error_kind(self.code).or_else(|| {
            let kind = self.data.as_ref()?.get("kind")?.clone();
            serde_json::from_value(kind).ok()
        })
    }
}

impl From<&EngineError> for RpcError {
    fn from(err: &EngineError) -> Self {
        let kind = err.kind();
        Self {
            code: error_code(kind),
            message: err.to_string(),
            data: Some(json!({ "kind": kind })),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{} ({})", self.message, kind),
            None => write!(f, "{} (code {})", self.message, self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_distinct_code() {
        let mut codes: Vec<i32> = KIND_CODES.iter().map(|(_, c)| *c).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), KIND_CODES.len());

        for (kind, code) in KIND_CODES {
            assert_eq!(error_code(kind), code);
            assert_eq!(error_kind(code), Some(kind));
            assert!((-32099..=-32000).contains(&code), "{} outside server range", code);
        }
        assert_eq!(error_kind(METHOD_NOT_FOUND), None);
    }

    #[test]
    fn engine_error_maps_to_its_kind_code() {
        let err = RpcError::from(&EngineError::NameConflict("web1".into()));
        assert_eq!(err.code, error_code(ErrorKind::NameConflict));
        assert_eq!(err.data, Some(json!({ "kind": "name_conflict" })));
        assert_eq!(err.kind(), Some(ErrorKind::NameConflict));
        assert_eq!(err.to_string(), "container name already in use: web1 (name_conflict)");
    }

    #[test]
    fn kind_falls_back_to_data() {
        let err = RpcError {
            code: -32050,
            message: "gone".into(),
            data: Some(json!({ "kind": "cancelled" })),
        };
        assert_eq!(err.kind(), Some(ErrorKind::Cancelled));
        assert_eq!(RpcError::internal("boom").kind(), None);
    }

    #[test]
    fn notification_has_no_id_on_the_wire() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"operations.cancel"}"#).unwrap();
        assert!(req.is_notification());
        assert!(req.check().is_ok());

        let wire = serde_json::to_value(Request::new("daemon.status", None, 9)).unwrap();
        assert_eq!(wire, json!({ "jsonrpc": "2.0", "method": "daemon.status", "id": 9 }));
    }

    #[test]
    fn wrong_version_is_an_invalid_request() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"1.0","method":"daemon.status","id":1}"#).unwrap();
        assert_eq!(req.check().unwrap_err().code, INVALID_REQUEST);
    }

    #[test]
    fn response_is_result_xor_error() {
        let ok = serde_json::to_value(Response::ok(json!(1), "done")).unwrap();
        assert_eq!(ok, json!({ "jsonrpc": "2.0", "result": "done", "id": 1 }));

        let failed = Response::failed(json!("a"), RpcError::unknown_method("x.y"));
        let wire = serde_json::to_value(&failed).unwrap();
        assert!(wire.get("result").is_none());
        assert_eq!(failed.into_result().unwrap_err().code, METHOD_NOT_FOUND);
    }
}
