// ---------------------------------------------------------------------------
// FeedServer — JSON-RPC dispatcher
// ---------------------------------------------------------------------------
//
// Routes JSON-RPC 2.0 requests (NDJSON over stdin) to the FeedOrchestrator.
// Stdin is read on the calling thread; each request is driven to completion
// on the tokio runtime before the next line is read, so responses come back
// in request order.
// ---------------------------------------------------------------------------

use std::collections::HashSet;
use std::io::{self, BufRead};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::runtime::Handle;

use crate::community::CommunityMetrics;
use crate::error::FeedError;
use crate::light_ranker::FollowGraph;
use crate::local::InMemoryFollowGraph;
use crate::orchestrator::{EngagementRecord, FeedOrchestrator, FeedRequest};
use crate::protocol::*;
use crate::transport::NdjsonTransport;

pub struct FeedServer {
	transport: NdjsonTransport,
	runtime: Handle,
	orchestrator: FeedOrchestrator,
	follow_graph: Arc<InMemoryFollowGraph>,
}

impl FeedServer {
	pub fn new(
		transport: NdjsonTransport,
		runtime: Handle,
		orchestrator: FeedOrchestrator,
		follow_graph: Arc<InMemoryFollowGraph>,
	) -> Self {
		Self {
			transport,
			runtime,
			orchestrator,
			follow_graph,
		}
	}

	/// Main loop: read requests until EOF or `shutdown`, then tear the
	/// orchestrator down.
	pub fn run(&self) -> Result<(), FeedError> {
		self.transport.write_ready(self.orchestrator.community_bucket());

		let stdin = io::stdin();
		for line_result in stdin.lock().lines() {
			let line = line_result?;
			if line.trim().is_empty() {
				continue;
			}

			let request: JsonRpcRequest = match serde_json::from_str(&line) {
				Ok(r) => r,
				Err(e) => {
					tracing::warn!(error = %e, "Failed to parse request");
					self.transport.write_parse_error(&e);
					continue;
				}
			};

			if !self.dispatch(request) {
				return Ok(());
			}
		}

		self.runtime.block_on(self.orchestrator.destroy());
		Ok(())
	}

	/// Handle one request and write its response. Returns `false` once the
	/// server should stop reading.
	fn dispatch(&self, req: JsonRpcRequest) -> bool {
		let id = req.id;
		let stop = req.method == "shutdown";
		match self.runtime.block_on(self.handle(&req.method, req.params)) {
			Some(outcome) => self.transport.write_outcome(id, outcome),
			None => self.transport.write_method_not_found(id, &req.method),
		}
		!stop
	}

	/// Run one method. `None` means the method is unknown.
	pub async fn handle(&self, method: &str, params: serde_json::Value) -> Option<Result<serde_json::Value, FeedError>> {
		let orch = &self.orchestrator;
		let result = match method {
			// -- Feed ----------------------------------------------------
			"feed/generate" => match parse_params::<FeedRequest>(params) {
				Ok(request) => to_json(&orch.generate_feed(request).await),
				Err(e) => Err(e),
			},

			// -- Engagement ----------------------------------------------
			"engagement/record" => parse_params::<EngagementRecord>(params).map(|record| {
				let sample = orch.record_engagement(record);
				json!({ "sample": sample })
			}),
			"features/extract" => match parse_params::<ExtractFeaturesParams>(params) {
				Ok(p) => self.handle_extract(p).await,
				Err(e) => Err(e),
			},
			"engagement/predict" => match parse_params::<PredictParams>(params) {
				Ok(p) => {
					let score = orch.predict_engagement(p.features, p.fallback).await;
					Ok(json!({ "score": score }))
				}
				Err(e) => Err(e),
			},

			// -- Personalization -----------------------------------------
			"profile/signal" => parse_params::<SignalParams>(params).map(|p| {
				let profile = orch.personalization().update_user_preferences(&p.user_id, &p.signal);
				json!({ "profile": profile })
			}),
			"profile/get" => parse_params::<UserParams>(params).map(|p| {
				let profile = orch.personalization().get_user_profile(&p.user_id);
				json!({ "profile": profile })
			}),
			"config/get" => match parse_params::<UserParams>(params) {
				Ok(p) => {
					let config = orch.personalization().get_user_config(&p.user_id).await;
					Ok(json!({ "config": config }))
				}
				Err(e) => Err(e),
			},
			"follows/set" => parse_params::<FolloweesParams>(params).map(|p| {
				let count = p.followees.len();
				self.follow_graph.set_followees(&p.user_id, p.followees);
				json!({ "count": count })
			}),

			// -- Community -----------------------------------------------
			"community/update" => parse_params::<CommunityMetrics>(params).map(|metrics| {
				let bucket = orch.update_community_metrics(&metrics);
				json!({ "communityBucket": bucket })
			}),

			// -- Service -------------------------------------------------
			"service/health" => to_json(&orch.get_service_health()),
			"service/stats" => to_json(&orch.get_service_stats()),

			// -- Sync & snapshots ----------------------------------------
			"sync/manual" => match orch.perform_manual_sync().await {
				Ok(op) => Ok(json!({ "operation": op })),
				Err(e) => Err(e),
			},
			"sync/full" => match orch.perform_full_sync().await {
				Ok(op) => Ok(json!({ "operation": op })),
				Err(e) => Err(e),
			},
			"sync/history" => Ok(json!({ "operations": orch.sync_history() })),
			"snapshot/create" => match parse_params::<SnapshotCreateParams>(params) {
				Ok(p) => match orch.create_snapshot(p.description).await {
					Ok(snapshot) => Ok(json!({ "snapshot": snapshot.info() })),
					Err(e) => Err(e),
				},
				Err(e) => Err(e),
			},
			"snapshot/list" => Ok(json!({ "snapshots": orch.list_snapshots() })),
			"snapshot/rollback" => match parse_params::<RollbackParams>(params) {
				Ok(p) => match orch.rollback_to(&p.snapshot_id).await {
					Ok(op) => Ok(json!({ "operation": op })),
					Err(e) => Err(e),
				},
				Err(e) => Err(e),
			},

			// -- Lifecycle -----------------------------------------------
			"shutdown" => {
				orch.destroy().await;
				Ok(json!({}))
			}

			_ => return None,
		};
		Some(result)
	}

	async fn handle_extract(&self, p: ExtractFeaturesParams) -> Result<serde_json::Value, FeedError> {
		let following: HashSet<String> = match &p.following {
			Some(list) => list.iter().cloned().collect(),
			None => self.follow_graph.followees(&p.user_id).await.unwrap_or_default(),
		};
		let user = p.user_context(following);
		let prefs = p
			.include_preferences
			.then(|| self.orchestrator.personalization().get_user_profile(&p.user_id));
		let features = self
			.orchestrator
			.extract_features(&p.candidate, &user, prefs.as_ref())
			.await;
		Ok(json!({ "features": features }))
	}
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, FeedError> {
	// Absent params deserialize like an empty object.
	let params = if params.is_null() { json!({}) } else { params };
	serde_json::from_value(params).map_err(|e| FeedError::InvalidParams(e.to_string()))
}

fn to_json(value: &impl Serialize) -> Result<serde_json::Value, FeedError> {
	Ok(serde_json::to_value(value)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
