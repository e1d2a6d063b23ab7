//! JSON-RPC 2.0 message model.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// A request ID. Servers may use either numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	/// Numeric ID.
	Number(i64),
	/// String ID.
	String(String),
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Number(n) => write!(f, "{n}"),
			Self::String(s) => write!(f, "{s:?}"),
		}
	}
}

/// A request with untyped params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyRequest {
	/// The request ID.
	pub id: RequestId,
	/// The method name.
	pub method: String,
	/// Raw params.
	#[serde(default)]
	pub params: JsonValue,
}

/// A notification with untyped params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyNotification {
	/// The method name.
	pub method: String,
	/// Raw params.
	#[serde(default)]
	pub params: JsonValue,
}

/// A response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyResponse {
	/// The ID of the request this responds to.
	pub id: RequestId,
	/// The result, present on success.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<JsonValue>,
	/// The error, present on failure.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ResponseError>,
}

impl AnyResponse {
	/// Converts the response into its outcome. A response with neither field set is a
	/// successful `null` result.
	pub fn into_result(self) -> std::result::Result<JsonValue, ResponseError> {
		match self.error {
			Some(err) => Err(err),
			None => Ok(self.result.unwrap_or(JsonValue::Null)),
		}
	}
}

/// A JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
	/// Invalid JSON was received.
	pub const PARSE_ERROR: Self = Self(-32700);
	/// The JSON sent is not a valid request object.
	pub const INVALID_REQUEST: Self = Self(-32600);
	/// The method does not exist or is not available.
	pub const METHOD_NOT_FOUND: Self = Self(-32601);
	/// Invalid method parameters.
	pub const INVALID_PARAMS: Self = Self(-32602);
	/// Internal JSON-RPC error.
	pub const INTERNAL_ERROR: Self = Self(-32603);
	/// The request was cancelled.
	pub const REQUEST_CANCELLED: Self = Self(-32800);
	/// The request failed for a reason the server could name.
	pub const REQUEST_FAILED: Self = Self(-32803);
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// The error object of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ResponseError {
	/// The error code.
	pub code: ErrorCode,
	/// A short description.
	pub message: String,
	/// Additional information about the error.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}

impl ResponseError {
	/// Creates an error without additional data.
	pub fn new(code: ErrorCode, message: impl fmt::Display) -> Self {
		Self {
			code,
			message: message.to_string(),
			data: None,
		}
	}
}

/// Any message that can travel over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// A request expecting a response.
	Request(AnyRequest),
	/// A response to an earlier request.
	Response(AnyResponse),
	/// A notification.
	Notification(AnyNotification),
}

impl Message {
	/// Classifies a decoded JSON object.
	///
	/// An `id` without `method` is a response, a `method` without `id` is a notification, and
	/// both together make a server-initiated request.
	pub fn from_value(value: JsonValue) -> Result<Self> {
		let has_id = value.get("id").is_some_and(|id| !id.is_null());
		let has_method = value.get("method").is_some();
		match (has_id, has_method) {
			(true, false) => Ok(Self::Response(serde_json::from_value(value)?)),
			(false, true) => Ok(Self::Notification(serde_json::from_value(value)?)),
			(true, true) => Ok(Self::Request(serde_json::from_value(value)?)),
			(false, false) => Err(Error::Protocol(format!("message has neither id nor method: {value}"))),
		}
	}

	/// Builds the JSON object sent on the wire.
	pub fn to_value(&self) -> JsonValue {
		match self {
			Self::Request(req) => serde_json::json!({
				"jsonrpc": "2.0",
				"id": req.id,
				"method": req.method,
				"params": req.params,
			}),
			Self::Notification(notif) => serde_json::json!({
				"jsonrpc": "2.0",
				"method": notif.method,
				"params": notif.params,
			}),
			Self::Response(resp) => match &resp.error {
				Some(err) => serde_json::json!({
					"jsonrpc": "2.0",
					"id": resp.id,
					"error": err,
				}),
				None => serde_json::json!({
					"jsonrpc": "2.0",
					"id": resp.id,
					"result": resp.result.clone().unwrap_or(JsonValue::Null),
				}),
			},
		}
	}

	/// Method name for requests and notifications.
	pub fn method(&self) -> Option<&str> {
		match self {
			Self::Request(req) => Some(&req.method),
			Self::Notification(notif) => Some(&notif.method),
			Self::Response(_) => None,
		}
	}
}
