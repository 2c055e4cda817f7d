//! Configuration for broker construction.

use std::time::Duration;

use crate::message::PayloadEncoding;

/// Backend family the broker connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
	/// Exchange-based backend (AMQP 0.9.1)
	Amqp,
	/// Flat-topic backend (MQTT)
	Mqtt,
	/// Pattern pub/sub backend (Redis)
	Redis,
}

/// Exchange topology declared by the AMQP adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeType {
	/// Routing-key pattern matching
	#[default]
	Topic,
	/// Exact routing-key match
	Direct,
	/// Broadcast to every bound queue
	Fanout,
	/// Header-table matching
	Headers,
}

impl ExchangeType {
	/// Wire name of the exchange type.
	pub fn as_str(&self) -> &'static str {
		match self {
			| Self::Topic => "topic",
			| Self::Direct => "direct",
			| Self::Fanout => "fanout",
			| Self::Headers => "headers",
		}
	}
}

/// Delivery quality level, mapped to backend-native semantics.
///
/// Only the MQTT adapter distinguishes all three levels; the other
/// backends keep their native guarantees regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
	/// Fire and forget
	AtMostOnce,
	/// Delivery acknowledged, may duplicate
	#[default]
	AtLeastOnce,
	/// Exactly-once handshake where the backend supports it
	ExactlyOnce,
}

/// Pass-through tuning for consuming operations.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
	/// Subscription quality level (MQTT)
	pub qos: QosLevel,
	/// Request exclusive consumer access to the queue (AMQP)
	pub exclusive: bool,
}

/// Pass-through tuning for publishing operations.
#[derive(Debug, Clone)]
pub struct PublishOptions {
	/// Publish quality level (MQTT)
	pub qos: QosLevel,
	/// Ask the backend to retain the last message per topic (MQTT)
	pub retain: bool,
	/// Mark messages persistent so they survive broker restarts (AMQP)
	pub persistent: bool,
}

impl Default for PublishOptions {
	fn default() -> Self {
		Self {
			qos: QosLevel::default(),
			retain: false,
			persistent: true,
		}
	}
}

/// Validated construction configuration consumed by [`crate::connect`].
///
/// Connection is not attempted before the configuration is handed to the
/// factory, and the adapter holds no reference to it after construction.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
	/// Adapter selection
	pub backend: BackendKind,
	/// Connection targets; tried in order where the backend allows it
	pub urls: Vec<String>,
	/// Require delivery confirmation for publishes (AMQP)
	pub enable_ack: bool,
	/// Exchange every topic queue is bound to (AMQP)
	pub exchange_name: String,
	/// Exchange topology (AMQP)
	pub exchange_type: ExchangeType,
	/// Maximum wait for a publish confirmation
	pub publish_timeout: Duration,
	/// Maximum wait for the initial connection handshake
	pub connect_timeout: Duration,
	/// Encoding applied to structured payloads
	pub encoding: PayloadEncoding,
	/// Client identifier presented to the backend
	pub client_id: String,
	/// Backend-specific consuming tuning
	pub consume: ConsumeOptions,
	/// Backend-specific publishing tuning
	pub publish: PublishOptions,
}

impl BrokerConfig {
	/// Base configuration for the given backend and connection targets.
	pub fn new<I, S>(backend: BackendKind, urls: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			backend,
			urls: urls.into_iter().map(Into::into).collect(),
			enable_ack: false,
			exchange_name: "polybus".to_string(),
			exchange_type: ExchangeType::default(),
			publish_timeout: Duration::from_secs(30),
			connect_timeout: Duration::from_secs(10),
			encoding: PayloadEncoding::default(),
			client_id: "polybus".to_string(),
			consume: ConsumeOptions::default(),
			publish: PublishOptions::default(),
		}
	}

	/// Configuration for the AMQP adapter.
	pub fn amqp<I, S>(urls: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self::new(BackendKind::Amqp, urls)
	}

	/// Configuration for the MQTT adapter.
	pub fn mqtt(url: impl Into<String>) -> Self {
		Self::new(BackendKind::Mqtt, [url.into()])
	}

	/// Configuration for the Redis adapter.
	pub fn redis(url: impl Into<String>) -> Self {
		Self::new(BackendKind::Redis, [url.into()])
	}

	/// Require broker confirmation before `publish` resolves.
	pub fn with_enable_ack(mut self, enable_ack: bool) -> Self {
		self.enable_ack = enable_ack;
		self
	}

	/// Override the exchange name and type queues are bound to.
	pub fn with_exchange(
		mut self,
		name: impl Into<String>,
		exchange_type: ExchangeType,
	) -> Self {
		self.exchange_name = name.into();
		self.exchange_type = exchange_type;
		self
	}

	/// Override the maximum wait for a publish confirmation.
	pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
		self.publish_timeout = timeout;
		self
	}

	/// Override the maximum wait for the initial connection handshake.
	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	/// Override the structured payload encoding.
	pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
		self.encoding = encoding;
		self
	}

	/// Override the client identifier presented to the backend.
	pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
		self.client_id = client_id.into();
		self
	}

	/// Override consuming tuning options.
	pub fn with_consume(mut self, consume: ConsumeOptions) -> Self {
		self.consume = consume;
		self
	}

	/// Override publishing tuning options.
	pub fn with_publish(mut self, publish: PublishOptions) -> Self {
		self.publish = publish;
		self
	}

	/// First configured connection target, if any.
	pub fn primary_url(&self) -> Option<&str> {
		self.urls.first().map(String::as_str)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builder_overrides_defaults() {
		let config = BrokerConfig::amqp(["amqp://localhost:5672"])
			.with_enable_ack(true)
			.with_exchange("orders", ExchangeType::Topic)
			.with_publish_timeout(Duration::from_secs(5));

		assert_eq!(config.backend, BackendKind::Amqp);
		assert!(config.enable_ack);
		assert_eq!(config.exchange_name, "orders");
		assert_eq!(config.exchange_type.as_str(), "topic");
		assert_eq!(config.publish_timeout, Duration::from_secs(5));
	}

	#[test]
	fn single_url_constructors_keep_one_target() {
		let config = BrokerConfig::redis("redis://localhost:6379/0");
		assert_eq!(config.backend, BackendKind::Redis);
		assert_eq!(config.primary_url(), Some("redis://localhost:6379/0"));
		assert_eq!(config.urls.len(), 1);
	}
}
