// ---------------------------------------------------------------------------
// Integration tests for the feedmix-engine JSON-RPC 2.0 / NDJSON protocol
// ---------------------------------------------------------------------------
//
// Each test spawns a fresh feedmix-engine binary and talks to it over
// stdin/stdout with newline-delimited JSON-RPC 2.0 messages.
// ---------------------------------------------------------------------------

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

struct EngineProcess {
	child: Child,
	reader: BufReader<std::process::ChildStdout>,
	next_id: AtomicU64,
}

impl EngineProcess {
	fn spawn(extra_args: &[&str]) -> Self {
		let bin = env!("CARGO_BIN_EXE_feedmix-engine");
		let mut child = Command::new(bin)
			.args(extra_args)
			.env_remove("FEEDMIX_SNAPSHOT_DIR")
			.env_remove("FEEDMIX_CONFIG")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("failed to spawn feedmix-engine");

		let stdout = child.stdout.take().expect("no stdout");
		Self {
			child,
			reader: BufReader::new(stdout),
			next_id: AtomicU64::new(1),
		}
	}

	fn send(&mut self, method: &str, params: Value) -> RpcResponse {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let request = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});

		let stdin = self.child.stdin.as_mut().expect("no stdin");
		let mut line = serde_json::to_string(&request).unwrap();
		line.push('\n');
		stdin.write_all(line.as_bytes()).unwrap();
		stdin.flush().unwrap();

		loop {
			let mut buf = String::new();
			let bytes_read = self.reader.read_line(&mut buf).expect("failed to read from stdout");
			if bytes_read == 0 {
				panic!("unexpected EOF while waiting for response to id={id}");
			}
			let buf = buf.trim();
			if buf.is_empty() {
				continue;
			}
			let parsed: Value =
				serde_json::from_str(buf).unwrap_or_else(|e| panic!("invalid JSON from engine: {e}\nline: {buf}"));
			// Skip notifications (no id field)
			if parsed.get("id").is_none() {
				continue;
			}
			assert_eq!(parsed["id"].as_u64(), Some(id), "response id mismatch");
			if let Some(error) = parsed.get("error") {
				return RpcResponse::Error(error.clone());
			}
			return RpcResponse::Ok(parsed.get("result").cloned().unwrap_or(Value::Null));
		}
	}

	fn call(&mut self, method: &str, params: Value) -> Value {
		match self.send(method, params) {
			RpcResponse::Ok(v) => v,
			RpcResponse::Error(e) => panic!("expected success, got error: {e}"),
		}
	}

	fn call_err(&mut self, method: &str, params: Value) -> Value {
		match self.send(method, params) {
			RpcResponse::Error(e) => e,
			RpcResponse::Ok(v) => panic!("expected error, got success: {v}"),
		}
	}
}

impl Drop for EngineProcess {
	fn drop(&mut self) {
		drop(self.child.stdin.take());
		let _ = self.child.wait();
	}
}

#[derive(Debug)]
enum RpcResponse {
	Ok(Value),
	Error(Value),
}

fn now_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

fn candidates(n: u64, authors: u64) -> Vec<Value> {
	let now = now_ms();
	(0..n)
		.map(|i| {
			json!({
				"id": format!("note-{i}"),
				"authorId": format!("author-{}", i % authors),
				"createdAt": now - i * 90_000,
				"text": "a reasonably long note about #rust and async runtimes",
				"reactionCount": i % 9,
				"replyCount": i % 3,
				"authorFollowers": 50 * (i % 20),
			})
		})
		.collect()
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

#[test]
fn generate_feed_respects_limit_and_author_cap() {
	let mut engine = EngineProcess::spawn(&[]);
	let result = engine.call(
		"feed/generate",
		json!({ "userId": "viewer", "candidates": candidates(120, 40), "limit": 20 }),
	);
	let ids = result["contentIds"].as_array().expect("contentIds should be array");
	assert_eq!(ids.len(), 20);
	assert_eq!(result["inputCount"], 120);

	// At most 3 notes per author in one page.
	let mut per_author = std::collections::HashMap::new();
	for id in ids {
		let n: u64 = id.as_str().unwrap().trim_start_matches("note-").parse().unwrap();
		*per_author.entry(n % 40).or_insert(0) += 1;
	}
	assert!(per_author.values().all(|&c| c <= 3));
}

#[test]
fn session_does_not_repeat_content() {
	let mut engine = EngineProcess::spawn(&[]);
	let first = engine.call(
		"feed/generate",
		json!({ "userId": "viewer", "candidates": candidates(200, 50), "limit": 10 }),
	);
	let session_id = first["sessionId"].as_str().unwrap().to_string();
	let mut more = candidates(200, 50);
	// A different candidate set so the result cache does not apply.
	more.truncate(190);
	let second = engine.call(
		"feed/generate",
		json!({ "userId": "viewer", "sessionId": session_id, "candidates": more, "limit": 10 }),
	);
	let seen: std::collections::HashSet<&str> =
		first["contentIds"].as_array().unwrap().iter().filter_map(Value::as_str).collect();
	let repeats = second["contentIds"]
		.as_array()
		.unwrap()
		.iter()
		.filter_map(Value::as_str)
		.filter(|id| seen.contains(id))
		.count();
	assert_eq!(repeats, 0);
}

// ---------------------------------------------------------------------------
// Engagement & personalization
// ---------------------------------------------------------------------------

#[test]
fn record_engagement_updates_buffer_and_profile() {
	let mut engine = EngineProcess::spawn(&[]);
	let result = engine.call(
		"engagement/record",
		json!({
			"userId": "u1",
			"contentId": "note-1",
			"engagementType": "like",
			"features": { "recency": 0.9 },
			"authorId": "author-1",
			"topics": ["rust"],
		}),
	);
	assert_eq!(result["sample"]["engagementType"], "like");

	let stats = engine.call("service/stats", json!({}));
	assert_eq!(stats["buffer"]["size"], 1);
	assert_eq!(stats["engagementsRecorded"], 1);

	let profile = engine.call("profile/get", json!({ "userId": "u1" }));
	assert!(profile["profile"]["authorAffinities"]["author-1"].as_f64().unwrap() > 0.0);
}

#[test]
fn predict_returns_bounded_score() {
	let mut engine = EngineProcess::spawn(&[]);
	let result = engine.call(
		"engagement/predict",
		json!({ "features": { "lightScore": 0.8, "recency": 1.0, "velocity": 0.5 } }),
	);
	let score = result["score"].as_f64().unwrap();
	assert!((0.0..=1.0).contains(&score));
}

#[test]
fn community_update_switches_bucket() {
	let mut engine = EngineProcess::spawn(&[]);
	let result = engine.call("community/update", json!({ "activeUsers": 5_000 }));
	assert_eq!(result["communityBucket"], "large");
	let stats = engine.call("service/stats", json!({}));
	assert_eq!(stats["optimizer"]["batch"]["batchSize"], 25);
}

// ---------------------------------------------------------------------------
// Sync & snapshots
// ---------------------------------------------------------------------------

#[test]
fn manual_sync_and_rollback() {
	let mut engine = EngineProcess::spawn(&[]);
	for kind in ["reply", "share", "like"] {
		engine.call(
			"engagement/record",
			json!({ "userId": "u1", "contentId": "note-1", "engagementType": kind }),
		);
	}
	let sync = engine.call("sync/manual", json!({}));
	assert_eq!(sync["operation"]["status"], "success");

	let created = engine.call("snapshot/create", json!({ "description": "known good" }));
	let snapshot_id = created["snapshot"]["id"].as_str().unwrap().to_string();
	let rollback = engine.call("snapshot/rollback", json!({ "snapshotId": snapshot_id }));
	assert_eq!(rollback["operation"]["kind"], "rollback");
	assert_eq!(rollback["operation"]["rollbackTargetId"], snapshot_id.as_str());

	let err = engine.call_err("snapshot/rollback", json!({ "snapshotId": "missing" }));
	assert_eq!(err["data"]["feedCode"], "SNAPSHOT_NOT_FOUND");
}

#[test]
fn snapshots_survive_restart_with_archive() {
	let dir = tempfile::tempdir().unwrap();
	let dir_arg = dir.path().to_str().unwrap();
	let snapshot_id = {
		let mut engine = EngineProcess::spawn(&["--snapshot-dir", dir_arg]);
		let created = engine.call("snapshot/create", json!({}));
		created["snapshot"]["id"].as_str().unwrap().to_string()
	};

	let mut engine = EngineProcess::spawn(&["--snapshot-dir", dir_arg]);
	let listed = engine.call("snapshot/list", json!({}));
	let ids: Vec<&str> = listed["snapshots"]
		.as_array()
		.unwrap()
		.iter()
		.filter_map(|s| s["id"].as_str())
		.collect();
	assert!(ids.contains(&snapshot_id.as_str()));
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[test]
fn unknown_method_returns_error() {
	let mut engine = EngineProcess::spawn(&[]);
	let err = engine.call_err("feed/nope", json!({}));
	assert_eq!(err["code"], -32601);
}

#[test]
fn invalid_params_are_reported() {
	let mut engine = EngineProcess::spawn(&[]);
	let err = engine.call_err("engagement/record", json!({ "userId": "u1" }));
	assert_eq!(err["code"], -32602);
	assert_eq!(err["data"]["feedCode"], "FEED_INVALID_PARAMS");
}

#[test]
fn shutdown_ends_the_process() {
	let mut engine = EngineProcess::spawn(&[]);
	let health = engine.call("service/health", json!({}));
	assert!(health["status"].is_string());
	engine.call("shutdown", json!({}));
	let status = engine.child.wait().unwrap();
	assert!(status.success());
}
