//! The unified broker contract.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tokio::sync::broadcast;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::lifecycle::{ConnectionEvent, ConnectionState};
use crate::message::{Delivery, Payload};

/// Subscription callback invoked for every message delivered on a topic.
///
/// Callbacks run on the adapter's dispatch task; long-running work should
/// be handed off (e.g. through a channel) rather than done inline.
pub type Callback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Unified publish/subscribe contract satisfied by every backend adapter.
///
/// The contract normalizes the call surface only; each backend keeps its
/// native delivery guarantees (AMQP acknowledges, MQTT honors QoS, Redis
/// pub/sub drops messages with no connected subscriber).
#[async_trait]
pub trait Broker: Send + Sync {
	/// Register `callback` to receive every message delivered on `topic`,
	/// materializing the backend resource for the topic if absent.
	///
	/// Subscribing again to the same topic replaces the previous callback;
	/// there is no fan-out to multiple callbacks within one instance.
	async fn subscribe(&self, topic: &str, callback: Callback) -> Result<()>;

	/// Cancel delivery for `topic` and release its backend resource.
	///
	/// Succeeds as a no-op when `topic` was never subscribed.
	async fn unsubscribe(&self, topic: &str) -> Result<()>;

	/// Send `payload` to `topic`, materializing the backend resource for
	/// the topic if absent.
	async fn publish(&self, topic: &str, payload: Payload) -> Result<()>;

	/// Release the connection and all cached topic resources.
	///
	/// Idempotent; every operation after the first `close` fails with
	/// [`BrokerError::Closed`].
	async fn close(&self) -> Result<()>;

	/// Current connection state.
	fn state(&self) -> ConnectionState;

	/// Subscribe to connection lifecycle events for logging/monitoring.
	fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

	/// Subscribe `callback` to every topic in `topics`.
	///
	/// Runs the single-topic subscriptions concurrently and completes when
	/// all have completed. On failure the first error is reported and
	/// already-established subscriptions stay in place.
	async fn subscribe_many(
		&self,
		topics: &[String],
		callback: Callback,
	) -> Result<()> {
		let results = future::join_all(
			topics
				.iter()
				.map(|topic| self.subscribe(topic, Arc::clone(&callback))),
		)
		.await;
		first_failure(results)
	}

	/// Unsubscribe from every topic in `topics`, concurrently.
	async fn unsubscribe_many(&self, topics: &[String]) -> Result<()> {
		let results = future::join_all(
			topics.iter().map(|topic| self.unsubscribe(topic)),
		)
		.await;
		first_failure(results)
	}

	/// Publish every payload in `payloads` to `topic`, concurrently.
	///
	/// Not transactional: a partial failure reports an error while the
	/// payloads that succeeded remain delivered.
	async fn publish_many(
		&self,
		topic: &str,
		payloads: Vec<Payload>,
	) -> Result<()> {
		let results = future::join_all(
			payloads
				.into_iter()
				.map(|payload| self.publish(topic, payload)),
		)
		.await;
		first_failure(results)
	}
}

/// Aggregate batched results: all operations have completed, report the
/// first failure without undoing the rest.
fn first_failure(results: Vec<Result<()>>) -> Result<()> {
	results.into_iter().find(|res| res.is_err()).unwrap_or(Ok(()))
}

/// Connect to the backend selected by `config` and return the adapter
/// behind the unified contract.
///
/// This is the "ready" signal: no connection exists before this call, and
/// the returned value is the only thing a caller programs against. Call
/// [`Broker::close`] to dispose of it.
pub async fn connect(config: BrokerConfig) -> Result<Box<dyn Broker>> {
	match config.backend {
		#[cfg(feature = "amqp")]
		| crate::config::BackendKind::Amqp => Ok(Box::new(
			crate::adapter::amqp::AmqpBroker::connect(config).await?,
		)),
		#[cfg(feature = "mqtt")]
		| crate::config::BackendKind::Mqtt => Ok(Box::new(
			crate::adapter::mqtt::MqttBroker::connect(config).await?,
		)),
		#[cfg(feature = "redis")]
		| crate::config::BackendKind::Redis => Ok(Box::new(
			crate::adapter::redis::RedisBroker::connect(config).await?,
		)),
		#[allow(unreachable_patterns)]
		| backend => Err(BrokerError::protocol(format!(
			"support for {backend:?} backend was not compiled in"
		))),
	}
}
