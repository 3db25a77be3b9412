//! The subset of JSON-RPC 2.0 spoken on the wire: `tools/call` requests in, one response out for
//! each.
//!
//! Error objects and codes are borrowed from `jsonrpsee-types`.  The envelope itself is serialized
//! here because clients may use any integer as a request id, including negative ones, and the id
//! has to be echoed back exactly as it was sent.  Requests are picked apart by hand because the
//! clients we care about are lax (the `jsonrpc` and `id` members are frequently omitted) and every
//! deviation needs to map onto a specific error kind.
use jsonrpsee_types as jsonrpc;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Number, Value};

/// The only method this server answers
pub const TOOLS_CALL: &str = "tools/call";

const JSONRPC_VERSION: &str = "2.0";

/// A request id.  Numbers are kept exactly as the client wrote them so they round-trip unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Id {
    Null,
    Number(Number),
    Str(String),
}

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Id::Number(id.into())
    }
}

impl From<i64> for Id {
    fn from(id: i64) -> Self {
        Id::Number(id.into())
    }
}

#[derive(Debug)]
enum ResponsePayload {
    Success(Value),
    Error(jsonrpc::ErrorObjectOwned),
}

/// A response with a generic JSON payload.  The shape of a successful result depends on which tool
/// was called.
#[derive(Debug)]
pub struct GenericResponse {
    id: Id,
    payload: ResponsePayload,
}

impl Serialize for GenericResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match &self.payload {
            ResponsePayload::Success(result) => map.serialize_entry("result", result)?,
            ResponsePayload::Error(error) => map.serialize_entry("error", error)?,
        }
        map.serialize_entry("id", &self.id)?;
        map.end()
    }
}

/// Build a success response carrying `result`.
pub fn success_response(id: Id, result: Value) -> GenericResponse {
    GenericResponse {
        id,
        payload: ResponsePayload::Success(result),
    }
}

/// Every way a request can fail, as reported to the client.
///
/// The numeric codes go in `error.code`; the symbolic name goes in `error.data.kind` so clients
/// don't need to memorize the numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidArguments,
    InternalError,
    ToolNotFound,
    CommandNotFound,
    ExecutionFailed,
}

impl ErrorKind {
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::ParseError => jsonrpc::ErrorCode::ParseError.code(),
            ErrorKind::InvalidRequest => jsonrpc::ErrorCode::InvalidRequest.code(),
            ErrorKind::MethodNotFound => jsonrpc::ErrorCode::MethodNotFound.code(),
            ErrorKind::InvalidArguments => jsonrpc::ErrorCode::InvalidParams.code(),
            ErrorKind::InternalError => jsonrpc::ErrorCode::InternalError.code(),
            ErrorKind::ToolNotFound => -32001,
            ErrorKind::CommandNotFound => -32002,
            ErrorKind::ExecutionFailed => -32003,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorKind::InvalidArguments => "INVALID_ARGUMENTS",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorKind::CommandNotFound => "COMMAND_NOT_FOUND",
            ErrorKind::ExecutionFailed => "EXECUTION_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of the `data` member of every error we send
#[derive(Debug, Serialize)]
struct ErrorData {
    kind: &'static str,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

/// An error destined for the client, with enough information to produce a proper JSON-RPC error
/// response.
#[derive(Clone, Debug, PartialEq)]
pub struct JsonRpcError {
    kind: ErrorKind,
    message: String,
    id: Option<Id>,
    details: Vec<String>,
}

impl JsonRpcError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        id: impl Into<Option<Id>>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            id: id.into(),
            details: vec![],
        }
    }

    /// Make a new error from a Rust error, capturing its source chain in `data.details`
    pub fn from_error(
        kind: ErrorKind,
        error: &(dyn std::error::Error + 'static),
        id: impl Into<Option<Id>>,
    ) -> Self {
        let mut details = vec![];
        let mut inner = error.source();
        while let Some(e) = inner {
            details.push(e.to_string());
            inner = e.source();
        }

        Self {
            details,
            ..Self::new(kind, error.to_string(), id)
        }
    }

    /// The line wasn't JSON at all.  There's no way to know what the id was.
    pub fn parse_error(error: serde_json::Error) -> Self {
        Self::from_error(ErrorKind::ParseError, &error, None)
    }

    pub fn invalid_request(
        reason: impl Into<String>,
        id: impl Into<Option<Id>>,
    ) -> Self {
        Self::new(
            ErrorKind::InvalidRequest,
            format!("Invalid request: {}", reason.into()),
            id,
        )
    }

    pub fn method_not_found(method: &str, id: Id) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("Method not found: {}", method),
            id,
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }
}

impl From<JsonRpcError> for GenericResponse {
    fn from(error: JsonRpcError) -> Self {
        let data = ErrorData {
            kind: error.kind.as_str(),
            details: error.details,
        };
        GenericResponse {
            id: error.id.unwrap_or(Id::Null),
            payload: ResponsePayload::Error(jsonrpc::ErrorObjectOwned::owned(
                error.kind.code(),
                error.message,
                Some(data),
            )),
        }
    }
}

/// A request that is structurally valid and names the `tools/call` method.  What's inside `params`
/// is the dispatcher's business.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallRequest {
    pub id: Id,
    pub params: Option<Value>,
}

/// Parse one line of input into a tool call.
///
/// On failure the returned error carries the request id whenever it could be recovered.
pub fn parse_request(line: &str) -> Result<ToolCallRequest, JsonRpcError> {
    let value: Value = serde_json::from_str(line).map_err(JsonRpcError::parse_error)?;

    let Value::Object(mut request) = value else {
        return Err(JsonRpcError::invalid_request(
            "request must be a JSON object",
            None,
        ));
    };

    let id = match request.remove("id") {
        None => Id::Null,
        Some(id) => parse_id(id).ok_or_else(|| {
            JsonRpcError::invalid_request(
                "id must be null, an integer or a string",
                None,
            )
        })?,
    };

    if let Some(version) = request.get("jsonrpc") {
        if version.as_str() != Some(JSONRPC_VERSION) {
            return Err(JsonRpcError::invalid_request(
                format!("unsupported jsonrpc version {version}"),
                id,
            ));
        }
    }

    let method = match request.remove("method") {
        Some(Value::String(method)) => method,
        Some(_) => return Err(JsonRpcError::invalid_request("method must be a string", id)),
        None => return Err(JsonRpcError::invalid_request("missing method", id)),
    };
    if method != TOOLS_CALL {
        return Err(JsonRpcError::method_not_found(&method, id));
    }

    Ok(ToolCallRequest {
        id,
        params: request.remove("params"),
    })
}

/// Accepts null, strings, and integers of either sign.  Fractional numbers are rejected.
fn parse_id(id: Value) -> Option<Id> {
    match id {
        Value::Null => Some(Id::Null),
        Value::Number(number) if number.is_i64() || number.is_u64() => Some(Id::Number(number)),
        Value::String(s) => Some(Id::Str(s)),
        _ => None,
    }
}
