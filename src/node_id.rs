//! OPC UA node identifier: a validated, opaque, server-scoped key.

use std::fmt;

use crate::error::{Error, Result};

/// A validated OPC UA node identifier in the form `ns=<uint>;s=<id>` or `ns=<uint>;i=<uint>`.
///
/// Cheap to clone (backed by an `Arc<str>`) since the same id is threaded through the cache,
/// the subscription manager, and the background queue.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(std::sync::Arc<str>);
impl NodeId {
	/// Validate and wrap a raw node id string.
	///
	/// Mirrors the inbound HTTP boundary's `^ns=\d+;[si]=.+$` check; the core re-validates
	/// defensively rather than trusting callers that bypass the HTTP layer.
	pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
		let raw = raw.as_ref();

		if !is_well_formed(raw) {
			return Err(Error::Validation {
				field: "node_id",
				reason: format!("'{raw}' does not match ns=<uint>;[si]=<id>"),
			});
		}

		Ok(Self(std::sync::Arc::from(raw)))
	}

	/// Borrow the underlying string.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
impl AsRef<str> for NodeId {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
impl serde::Serialize for NodeId {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(&self.0)
	}
}
impl<'de> serde::Deserialize<'de> for NodeId {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;

		Self::parse(raw).map_err(serde::de::Error::custom)
	}
}

/// Hand-rolled match for `^ns=\d+;[si]=.+$`; a single anchored literal pattern does not
/// warrant pulling in a regex engine.
fn is_well_formed(raw: &str) -> bool {
	let Some(rest) = raw.strip_prefix("ns=") else { return false };
	let Some(semicolon) = rest.find(';') else { return false };
	let (ns, rest) = rest.split_at(semicolon);

	if ns.is_empty() || !ns.bytes().all(|b| b.is_ascii_digit()) {
		return false;
	}

	let rest = &rest[1..]; // drop the ';'
	let Some(rest) = rest.strip_prefix('s').or_else(|| rest.strip_prefix('i')) else {
		return false;
	};
	let Some(id) = rest.strip_prefix('=') else { return false };

	!id.is_empty()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_string_and_numeric_ids() {
		assert!(NodeId::parse("ns=2;s=Temp1").is_ok());
		assert!(NodeId::parse("ns=0;i=1001").is_ok());
	}

	#[test]
	fn rejects_malformed_ids() {
		assert!(NodeId::parse("Temp1").is_err());
		assert!(NodeId::parse("ns=;s=Temp1").is_err());
		assert!(NodeId::parse("ns=2;x=Temp1").is_err());
		assert!(NodeId::parse("ns=2;s=").is_err());
		assert!(NodeId::parse("ns=2s=Temp1").is_err());
	}

	#[test]
	fn display_round_trips_the_original_string() {
		let id = NodeId::parse("ns=2;s=Temp1").unwrap();

		assert_eq!(id.as_str(), "ns=2;s=Temp1");
		assert_eq!(id.to_string(), "ns=2;s=Temp1");
	}
}
