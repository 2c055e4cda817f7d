//! Message envelope and payload encoding.

use arcstr::ArcStr;
use bytes::Bytes;

use crate::error::BrokerError;

/// Outbound payload accepted by `publish`.
///
/// Raw bytes pass through unchanged on every backend. Structured values are
/// encoded according to the adapter's configured [`PayloadEncoding`].
#[derive(Debug, Clone)]
pub enum Payload {
	/// Pre-encoded bytes, sent as-is
	Bytes(Bytes),
	/// Structured value, encoded by the adapter before transmission
	Json(serde_json::Value),
}

impl Payload {
	/// Wrap an already-serializable value as a structured payload.
	///
	/// Fails with [`BrokerError::Serialization`] when the value cannot be
	/// represented as JSON (e.g. a map with non-string keys).
	pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, BrokerError> {
		Ok(Self::Json(serde_json::to_value(value)?))
	}
}

impl From<Bytes> for Payload {
	fn from(bytes: Bytes) -> Self {
		Self::Bytes(bytes)
	}
}

impl From<Vec<u8>> for Payload {
	fn from(bytes: Vec<u8>) -> Self {
		Self::Bytes(Bytes::from(bytes))
	}
}

impl From<&str> for Payload {
	fn from(text: &str) -> Self {
		Self::Bytes(Bytes::copy_from_slice(text.as_bytes()))
	}
}

impl From<serde_json::Value> for Payload {
	fn from(value: serde_json::Value) -> Self {
		Self::Json(value)
	}
}

/// Wire encoding applied to structured payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
	/// Structured values are serialized to JSON text
	#[default]
	Json,
	/// Only pre-encoded bytes are accepted; structured values are rejected
	Raw,
}

/// Encode an outbound payload to wire bytes.
pub(crate) fn encode(
	payload: Payload,
	encoding: PayloadEncoding,
) -> Result<Bytes, BrokerError> {
	match (payload, encoding) {
		| (Payload::Bytes(bytes), _) => Ok(bytes),
		| (Payload::Json(value), PayloadEncoding::Json) => {
			Ok(Bytes::from(serde_json::to_vec(&value)?))
		}
		| (Payload::Json(_), PayloadEncoding::Raw) => {
			Err(BrokerError::serialization(
				"structured payload requires json encoding",
			))
		}
	}
}

/// Delivery metadata handed to callbacks alongside the payload.
///
/// Always carries the topic the message arrived on. The remaining fields
/// are populated only where the backend provides them.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
	/// Topic the message was delivered on
	pub topic: ArcStr,
	/// Broker delivery tag, present on acknowledgement-capable backends
	pub delivery_tag: Option<u64>,
	/// Whether the backend flagged this delivery as a redelivery
	pub redelivered: bool,
	/// Subscription pattern that matched, for pattern-based backends
	pub pattern: Option<ArcStr>,
}

impl Metadata {
	/// Metadata carrying only the topic name.
	pub fn for_topic(topic: impl Into<ArcStr>) -> Self {
		Self {
			topic: topic.into(),
			..Self::default()
		}
	}
}

/// An inbound message as delivered to a subscription callback.
#[derive(Debug, Clone)]
pub struct Delivery {
	/// Topic the message was published on
	pub topic: ArcStr,
	/// Raw payload bytes as received from the transport
	pub payload: Bytes,
	/// Backend-specific delivery metadata
	pub metadata: Metadata,
}

impl Delivery {
	/// Decode the payload as a JSON value.
	pub fn payload_json(&self) -> Result<serde_json::Value, BrokerError> {
		Ok(serde_json::from_slice(&self.payload)?)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn json_value_encodes_to_json_text() {
		let payload = Payload::from(json!({"id": 1}));
		let bytes = encode(payload, PayloadEncoding::Json).unwrap();
		let decoded: serde_json::Value =
			serde_json::from_slice(&bytes).unwrap();
		assert_eq!(decoded, json!({"id": 1}));
	}

	#[test]
	fn raw_bytes_pass_through_unchanged() {
		let bytes = Bytes::from_static(b"\x00\x01binary");
		let encoded =
			encode(Payload::Bytes(bytes.clone()), PayloadEncoding::Raw)
				.unwrap();
		assert_eq!(encoded, bytes);

		// Raw bytes are also untouched under json encoding
		let encoded =
			encode(Payload::Bytes(bytes.clone()), PayloadEncoding::Json)
				.unwrap();
		assert_eq!(encoded, bytes);
	}

	#[test]
	fn structured_payload_rejected_under_raw_encoding() {
		let err = encode(Payload::from(json!([1, 2])), PayloadEncoding::Raw)
			.unwrap_err();
		assert!(matches!(err, BrokerError::Serialization(_)));
	}

	#[test]
	fn delivery_payload_decodes_round_trip() {
		let delivery = Delivery {
			topic: ArcStr::from("orders.created"),
			payload: Bytes::from_static(br#"{"id":1}"#),
			metadata: Metadata::for_topic("orders.created"),
		};
		assert_eq!(delivery.payload_json().unwrap(), json!({"id": 1}));
		assert_eq!(delivery.metadata.topic, "orders.created");
	}
}
