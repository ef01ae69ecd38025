//! HTTP-facing response shapes (`SPEC_FULL.md` §6). Serialization only — the core never parses
//! these back in, so there is no matching `Deserialize`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{cache::Status, error::Result, node_id::NodeId};

/// One node's outcome, as returned to an HTTP caller.
#[derive(Clone, Debug, Serialize)]
pub struct ReadResult {
	#[serde(rename = "nodeId")]
	node_id: NodeId,
	success: bool,
	reason: String,
	value: String,
	timestamp: i64,
	timestamp_iso: String,
	quality: &'static str,
}
impl ReadResult {
	/// Build a successful result from a cache entry or a fresh adapter reading.
	pub fn ok(node_id: NodeId, value: impl Into<String>, status: Status, reason: impl Into<String>, source_timestamp_ms: i64) -> Self {
		Self {
			node_id,
			success: status == Status::Good,
			reason: reason.into(),
			value: value.into(),
			timestamp: source_timestamp_ms,
			timestamp_iso: to_iso(source_timestamp_ms),
			quality: if status == Status::Good { "good" } else { "bad" },
		}
	}

	/// Build an error result: no value could be produced for `node_id` at all (§7 taxonomy —
	/// a disconnected upstream with nothing cached, or a node the adapter does not recognize).
	pub fn error(node_id: NodeId, reason: impl Into<String>, now_ms: i64) -> Self {
		Self {
			node_id,
			success: false,
			reason: reason.into(),
			value: String::new(),
			timestamp: now_ms,
			timestamp_iso: to_iso(now_ms),
			quality: "bad",
		}
	}

	/// Whether this result should count toward `metadata.success_count`.
	pub fn is_success(&self) -> bool {
		self.success
	}

	/// The node id this result is for.
	pub fn node_id(&self) -> &NodeId {
		&self.node_id
	}
}

fn to_iso(timestamp_ms: i64) -> String {
	DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
		.unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap())
		.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Aggregate counters returned alongside a batch of [`ReadResult`]s.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Metadata {
	success_count: usize,
	error_count: usize,
}

/// The full envelope returned by the read endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct ReadResponse {
	#[serde(rename = "readResults")]
	read_results: Vec<ReadResult>,
	timestamp: i64,
	count: usize,
	metadata: Metadata,
}
impl ReadResponse {
	/// Assemble a response envelope from a batch of results, stamping the envelope timestamp
	/// at `now_ms`.
	pub fn new(read_results: Vec<ReadResult>, now_ms: i64) -> Self {
		let success_count = read_results.iter().filter(|result| result.is_success()).count();
		let count = read_results.len();

		Self {
			read_results,
			timestamp: now_ms,
			count,
			metadata: Metadata { success_count, error_count: count - success_count },
		}
	}

	/// Serialize this envelope to the JSON body an HTTP handler would write to the response.
	pub fn to_json(&self) -> Result<String> {
		Ok(serde_json::to_string(self)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn good_status_is_reported_as_success_with_lowercase_quality() {
		let result = ReadResult::ok(NodeId::parse("ns=2;s=A").unwrap(), "42", Status::Good, "Good", 1_710_000_000_123);

		assert!(result.is_success());
		assert_eq!(result.quality, "good");
	}

	#[test]
	fn bad_status_is_not_a_success() {
		let result = ReadResult::ok(NodeId::parse("ns=2;s=A").unwrap(), "", Status::Bad, "BadNodeIdUnknown", 0);

		assert!(!result.is_success());
		assert_eq!(result.quality, "bad");
	}

	#[test]
	fn envelope_counts_successes_and_errors() {
		let results = vec![
			ReadResult::ok(NodeId::parse("ns=2;s=A").unwrap(), "1", Status::Good, "Good", 0),
			ReadResult::error(NodeId::parse("ns=2;s=B").unwrap(), "Disconnected", 0),
		];
		let response = ReadResponse::new(results, 0);

		assert_eq!(response.metadata.success_count, 1);
		assert_eq!(response.metadata.error_count, 1);
		assert_eq!(response.count, 2);
	}

	#[test]
	fn to_json_round_trips_through_serde_json() {
		let response = ReadResponse::new(vec![ReadResult::ok(NodeId::parse("ns=2;s=A").unwrap(), "1", Status::Good, "Good", 0)], 0);
		let json = response.to_json().unwrap();

		assert!(json.contains("\"readResults\""));
		assert!(json.contains("\"nodeId\""));
	}
}
