//! Pattern pub/sub adapter backed by Redis.
//!
//! Subscriptions use server-side pattern matching (`PSUBSCRIBE`); the
//! registry tracks only which patterns are active. Publishing rides a
//! separate connection duplicated from the primary, so a blocked or slow
//! consumer connection never stalls outbound publishes.
//!
//! Delivery carries no acknowledgement and no persistence: a message
//! published while no subscriber is connected is lost. That is the
//! backend's native guarantee and this adapter does not patch over it.

use std::sync::{Arc, Mutex};

use arcstr::ArcStr;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::broker::{Broker, Callback};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::lifecycle::{ConnectionEvent, ConnectionMonitor, ConnectionState};
use crate::message::{encode, Delivery, Metadata, Payload, PayloadEncoding};
use crate::registry::CallbackTable;

/// Pattern pub/sub broker adapter.
pub struct RedisBroker {
	sink: tokio::sync::Mutex<PubSubSink>,
	publisher: MultiplexedConnection,
	callbacks: Arc<CallbackTable>,
	monitor: Arc<ConnectionMonitor>,
	dispatch_task: Mutex<Option<JoinHandle<()>>>,
	encoding: PayloadEncoding,
}

impl std::fmt::Debug for RedisBroker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisBroker")
			.field("encoding", &self.encoding)
			.finish_non_exhaustive()
	}
}

impl RedisBroker {
	/// Connect the subscriber connection and its duplicate for publishing.
	pub async fn connect(config: BrokerConfig) -> Result<Self> {
		let url = config.primary_url().ok_or_else(|| {
			BrokerError::protocol("no connection target configured")
		})?;
		if !url.starts_with("redis") {
			return Err(BrokerError::protocol(format!(
				"redis url must start with redis://, got {url}"
			)));
		}
		let client = redis::Client::open(url).map_err(classify)?;

		let monitor = Arc::new(ConnectionMonitor::new());
		monitor.begin_connect();

		let pubsub = match time::timeout(
			config.connect_timeout,
			client.get_async_pubsub(),
		)
		.await
		{
			| Ok(Ok(pubsub)) => pubsub,
			| Ok(Err(err)) => {
				monitor.observe(ConnectionEvent::ConnectFailed);
				return Err(classify(err));
			}
			| Err(_) => {
				monitor.observe(ConnectionEvent::ConnectFailed);
				return Err(BrokerError::connection(format!(
					"connection attempt timed out after {:?}",
					config.connect_timeout
				)));
			}
		};
		// Dedicated outbound connection: a subscriber connection cannot
		// issue PUBLISH, and a blocked consumer must not stall publishes
		let publisher = match time::timeout(
			config.connect_timeout,
			client.get_multiplexed_async_connection(),
		)
		.await
		{
			| Ok(Ok(connection)) => connection,
			| Ok(Err(err)) => {
				monitor.observe(ConnectionEvent::ConnectFailed);
				return Err(classify(err));
			}
			| Err(_) => {
				monitor.observe(ConnectionEvent::ConnectFailed);
				return Err(BrokerError::connection(format!(
					"connection attempt timed out after {:?}",
					config.connect_timeout
				)));
			}
		};
		monitor.observe(ConnectionEvent::Connected);

		let (sink, stream) = pubsub.split();
		let callbacks = Arc::new(CallbackTable::new());
		let dispatch_task = tokio::spawn(Self::dispatch(
			stream,
			Arc::clone(&callbacks),
			Arc::clone(&monitor),
		));

		Ok(Self {
			sink: tokio::sync::Mutex::new(sink),
			publisher,
			callbacks,
			monitor,
			dispatch_task: Mutex::new(Some(dispatch_task)),
			encoding: config.encoding,
		})
	}

	/// Route inbound messages to the callback registered for the pattern
	/// that matched them.
	async fn dispatch(
		mut stream: PubSubStream,
		callbacks: Arc<CallbackTable>,
		monitor: Arc<ConnectionMonitor>,
	) {
		while let Some(msg) = stream.next().await {
			let channel = ArcStr::from(msg.get_channel_name());
			let pattern: Option<String> = msg.get_pattern().ok();
			let key = pattern.as_deref().unwrap_or(channel.as_str());
			match callbacks.get(key) {
				| Some(callback) => {
					let metadata = Metadata {
						topic: channel.clone(),
						delivery_tag: None,
						redelivered: false,
						pattern: pattern.map(ArcStr::from),
					};
					callback(Delivery {
						topic: channel,
						payload: Bytes::copy_from_slice(
							msg.get_payload_bytes(),
						),
						metadata,
					});
				}
				| None => {
					debug!(
						channel = %channel,
						"message for pattern with no registered callback"
					);
				}
			}
		}
		// Stream end means the subscriber connection is gone
		if !monitor.state().is_closed() {
			error!("redis subscriber connection lost");
			monitor.observe(ConnectionEvent::Disconnected);
		}
	}

	/// Patterns currently subscribed, for diagnostics.
	pub fn active_patterns(&self) -> Vec<ArcStr> {
		self.callbacks.topics()
	}
}

#[async_trait]
impl Broker for RedisBroker {
	async fn subscribe(&self, topic: &str, callback: Callback) -> Result<()> {
		// No server-side durability: fail fast while not connected
		self.monitor.guard_operable()?;
		let previous = self.callbacks.insert(topic, callback);
		let mut sink = self.sink.lock().await;
		if let Err(err) = sink.psubscribe(topic).await {
			drop(sink);
			match previous {
				| Some(prior) => {
					self.callbacks.insert(topic, prior);
				}
				| None => {
					self.callbacks.remove(topic);
				}
			}
			return Err(classify(err));
		}
		Ok(())
	}

	async fn unsubscribe(&self, topic: &str) -> Result<()> {
		self.monitor.guard_open()?;
		if self.callbacks.remove(topic).is_none() {
			// Pattern was never subscribed in this instance
			return Ok(());
		}
		let mut sink = self.sink.lock().await;
		sink.punsubscribe(topic).await.map_err(classify)
	}

	async fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
		self.monitor.guard_operable()?;
		let bytes = encode(payload, self.encoding)?;
		let mut connection = self.publisher.clone();
		let receivers: i64 = connection
			.publish(topic, bytes.as_ref())
			.await
			.map_err(classify)?;
		debug!(topic = %topic, receivers = receivers, "published");
		Ok(())
	}

	async fn close(&self) -> Result<()> {
		if !self.monitor.begin_close() {
			return Ok(());
		}
		let mut result = Ok(());
		let patterns = self.callbacks.topics();
		{
			let mut sink = self.sink.lock().await;
			for pattern in &patterns {
				if let Err(err) = sink.punsubscribe(pattern.as_str()).await {
					warn!(
						pattern = %pattern,
						error = %err,
						"failed to unsubscribe pattern during close"
					);
					if result.is_ok() {
						result = Err(classify(err));
					}
				}
			}
		}
		self.callbacks.clear();
		// Dropping the stream closes the subscriber connection
		if let Some(task) = self
			.dispatch_task
			.lock()
			.expect("dispatch task lock poisoned")
			.take()
		{
			task.abort();
		}
		self.monitor.finish_close();
		result
	}

	fn state(&self) -> ConnectionState {
		self.monitor.state()
	}

	fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
		self.monitor.events()
	}
}

/// Classify a transport error into the unified taxonomy.
fn classify(err: redis::RedisError) -> BrokerError {
	if err.is_io_error()
		|| err.is_connection_refusal()
		|| err.is_connection_dropped()
		|| err.is_timeout()
	{
		BrokerError::connection(err.to_string())
	} else {
		BrokerError::protocol(err.to_string())
	}
}
