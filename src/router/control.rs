//! Control protocol - runtime route administration over a request/reply
//! socket
//!
//! One JSON object per request: `{"method": "...", "params": {...}, "id":
//! <any>}`. Requests decode into [`ControlCommand`], one variant per
//! method, each with its own handler in the router; an unknown method is a
//! decode error answered over the channel, never a crash. Unparsable JSON
//! gets no reply at all - it is logged and dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RouteKey;

/// A decoded control request.
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    #[serde(flatten)]
    pub command: ControlCommand,

    /// Echoed verbatim in the reply so clients can correlate.
    #[serde(default)]
    pub id: Value,
}

/// The set of administrative commands the router understands.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Stop the router loop cooperatively.
    Shutdown,

    /// Add a dynamic route; sockets are referenced by registered name.
    RouteAdd(RouteAddParams),

    /// Remove a dynamic route.
    RouteDel(RouteDelParams),

    /// Snapshot of all active routes.
    RouteDump,

    /// Snapshot of the router's counters.
    Stats,
}

#[derive(Debug, Deserialize)]
pub struct RouteAddParams {
    #[serde(default)]
    pub to: Option<RouteKey>,

    #[serde(default)]
    pub from: Option<RouteKey>,

    pub src: String,

    pub dest: String,

    #[serde(rename = "static", default)]
    pub static_route: bool,
}

#[derive(Debug, Deserialize)]
pub struct RouteDelParams {
    #[serde(default)]
    pub to: Option<RouteKey>,

    #[serde(default)]
    pub from: Option<RouteKey>,
}

/// Reply to a control request.
///
/// `error` is the empty string on success; on failure `result` is null and
/// `error` carries the message.
#[derive(Debug, Serialize)]
pub struct ControlReply {
    pub result: Value,
    pub error: String,
    pub id: Value,
}

impl ControlReply {
    pub fn ok(result: impl Serialize, id: Value) -> Self {
        Self {
            result: serde_json::to_value(result).unwrap_or(Value::Null),
            error: String::new(),
            id,
        }
    }

    pub fn err(error: impl std::fmt::Display, id: Value) -> Self {
        Self {
            result: Value::Null,
            error: error.to_string(),
            id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"result":null,"error":"reply serialization failed","id":null}"#.to_string())
    }
}

/// Outcome of decoding one control request body.
#[derive(Debug)]
pub enum ParsedRequest {
    /// A well-formed request.
    Ok(ControlRequest),

    /// Valid JSON that is not a valid request (unknown method, bad params).
    /// Answered with an error reply, echoing the id where one was present.
    Invalid { error: String, id: Value },

    /// Not JSON at all. Logged by the caller; no reply is sent.
    Unparsable(serde_json::Error),
}

/// Two-stage decode: JSON first, then the typed request.
pub fn parse_request(body: &str) -> ParsedRequest {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => return ParsedRequest::Unparsable(e),
    };

    // Keep the id for the error reply even when the rest is bad.
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    match serde_json::from_value::<ControlRequest>(value) {
        Ok(request) => ParsedRequest::Ok(request),
        Err(e) => ParsedRequest::Invalid {
            error: format!("invalid control request: {e}"),
            id,
        },
    }
}
