// ---------------------------------------------------------------------------
// NDJSON transport
// ---------------------------------------------------------------------------
//
// One JSON-RPC 2.0 message per line. Engine failures are rendered here:
// `FeedError` picks the JSON-RPC code and carries its machine code as data.
// ---------------------------------------------------------------------------

use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::json;

use crate::community::CommunityBucket;
use crate::error::FeedError;
use crate::lock;
use crate::protocol::{FEED_ERROR, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};

#[derive(Serialize)]
#[serde(untagged)]
enum Outcome {
	Result { result: serde_json::Value },
	Error { error: ErrorBody },
}

#[derive(Serialize)]
struct Response {
	jsonrpc: &'static str,
	id: u64,
	#[serde(flatten)]
	outcome: Outcome,
}

#[derive(Serialize)]
struct ErrorBody {
	code: i32,
	message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	data: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct Notification<'a> {
	jsonrpc: &'static str,
	method: &'a str,
	params: serde_json::Value,
}

/// JSON-RPC code for an engine failure.
pub fn rpc_code(error: &FeedError) -> i32 {
	match error {
		FeedError::InvalidParams(_) => INVALID_PARAMS,
		FeedError::Io(_) | FeedError::Serialization(_) => INTERNAL_ERROR,
		_ => FEED_ERROR,
	}
}

pub struct NdjsonTransport {
	sink: Mutex<Box<dyn Write + Send>>,
}

impl NdjsonTransport {
	/// Write to stdout; logs go to stderr so the two never interleave.
	pub fn stdout() -> Self {
		Self::with_sink(io::stdout())
	}

	pub fn with_sink(sink: impl Write + Send + 'static) -> Self {
		Self {
			sink: Mutex::new(Box::new(sink)),
		}
	}

	/// Write the outcome of one dispatched method.
	pub fn write_outcome(&self, id: u64, outcome: Result<serde_json::Value, FeedError>) {
		match outcome {
			Ok(result) => self.write_response(id, result),
			Err(e) => self.write_feed_error(id, &e),
		}
	}

	pub fn write_response(&self, id: u64, result: serde_json::Value) {
		self.write_line(&Response {
			jsonrpc: "2.0",
			id,
			outcome: Outcome::Result { result },
		});
	}

	pub fn write_feed_error(&self, id: u64, error: &FeedError) {
		if rpc_code(error) == INTERNAL_ERROR {
			tracing::error!(id, code = error.code(), error = %error, "Request failed");
		} else {
			tracing::debug!(id, code = error.code(), error = %error, "Request rejected");
		}
		self.write_error(id, rpc_code(error), error.to_string(), Some(error.to_json_rpc_error()));
	}

	pub fn write_method_not_found(&self, id: u64, method: &str) {
		self.write_error(id, METHOD_NOT_FOUND, format!("Unknown method: {method}"), None);
	}

	/// Unparseable lines have no usable id; they are answered with id 0.
	pub fn write_parse_error(&self, error: &serde_json::Error) {
		self.write_error(0, PARSE_ERROR, format!("Parse error: {error}"), None);
	}

	pub fn write_ready(&self, bucket: CommunityBucket) {
		self.write_line(&Notification {
			jsonrpc: "2.0",
			method: "engine/ready",
			params: json!({ "communityBucket": bucket }),
		});
	}

	fn write_error(&self, id: u64, code: i32, message: String, data: Option<serde_json::Value>) {
		self.write_line(&Response {
			jsonrpc: "2.0",
			id,
			outcome: Outcome::Error {
				error: ErrorBody { code, message, data },
			},
		});
	}

	fn write_line(&self, message: &impl Serialize) {
		let mut line = match serde_json::to_vec(message) {
			Ok(line) => line,
			Err(e) => {
				tracing::error!(error = %e, "Failed to serialize message");
				return;
			}
		};
		line.push(b'\n');
		let mut sink = lock(&self.sink);
		if let Err(e) = sink.write_all(&line).and_then(|_| sink.flush()) {
			tracing::error!(error = %e, "Failed to write message");
		}
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
