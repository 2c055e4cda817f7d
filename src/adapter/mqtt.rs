//! Flat-topic adapter backed by MQTT.
//!
//! There is no server-side resource per topic beyond the subscription
//! itself: the adapter keeps a topic-to-callback table and dispatches
//! incoming publishes by exact topic lookup. One connection multiplexes
//! every topic in both directions; the transport's event loop handles
//! reconnection natively and this adapter only observes it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arcstr::ArcStr;
use async_trait::async_trait;
use rumqttc::Packet::{self, Disconnect, Publish};
use rumqttc::{
	AsyncClient, ConnAck, ConnectReturnCode, EventLoop, MqttOptions,
	SubscribeFilter,
	Event::{Incoming, Outgoing},
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Callback};
use crate::config::{BrokerConfig, QosLevel};
use crate::error::{BrokerError, Result};
use crate::lifecycle::{ConnectionEvent, ConnectionMonitor, ConnectionState};
use crate::message::{encode, Delivery, Metadata, Payload, PayloadEncoding};
use crate::registry::CallbackTable;

/// Capacity of the request channel between client handle and event loop.
const EVENT_LOOP_CAPACITY: usize = 10;

/// Consecutive poll errors tolerated before the event loop gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Settings distilled from [`BrokerConfig`] at construction.
struct MqttSettings {
	subscribe_qos: rumqttc::QoS,
	publish_qos: rumqttc::QoS,
	retain: bool,
	encoding: PayloadEncoding,
}

/// Flat-topic broker adapter.
pub struct MqttBroker {
	client: AsyncClient,
	callbacks: Arc<CallbackTable>,
	monitor: Arc<ConnectionMonitor>,
	event_loop_task: Mutex<Option<JoinHandle<()>>>,
	settings: MqttSettings,
}

impl MqttBroker {
	/// Connect to the configured MQTT target and start the event loop.
	pub async fn connect(config: BrokerConfig) -> Result<Self> {
		let monitor = Arc::new(ConnectionMonitor::new());
		monitor.begin_connect();

		let url = config
			.primary_url()
			.ok_or_else(|| {
				BrokerError::protocol("no connection target configured")
			})?
			.to_string();
		let options = parse_options(url, &config.client_id)?;
		let (client, event_loop) =
			AsyncClient::new(options, EVENT_LOOP_CAPACITY);

		let event_loop = match time::timeout(
			config.connect_timeout,
			Self::establish_connection(event_loop),
		)
		.await
		{
			| Ok(Ok(event_loop)) => event_loop,
			| Ok(Err(err)) => {
				monitor.observe(ConnectionEvent::ConnectFailed);
				return Err(err);
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

		let callbacks = Arc::new(CallbackTable::new());
		let settings = MqttSettings {
			subscribe_qos: map_qos(config.consume.qos),
			publish_qos: map_qos(config.publish.qos),
			retain: config.publish.retain,
			encoding: config.encoding,
		};

		let event_loop_task = tokio::spawn(Self::run(
			event_loop,
			client.clone(),
			Arc::clone(&callbacks),
			Arc::clone(&monitor),
			settings.subscribe_qos,
		));

		Ok(Self {
			client,
			callbacks,
			monitor,
			event_loop_task: Mutex::new(Some(event_loop_task)),
			settings,
		})
	}

	/// Drive the event loop until the broker accepts or rejects the
	/// connection.
	async fn establish_connection(
		mut event_loop: EventLoop,
	) -> Result<EventLoop> {
		loop {
			match event_loop.poll().await {
				| Ok(Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
					if code == ConnectReturnCode::Success {
						debug!("MQTT connection established");
						return Ok(event_loop);
					}
					debug!(code = ?code, "MQTT connection rejected by broker");
					return Err(BrokerError::protocol(format!(
						"broker rejected connection: {code:?}"
					)));
				}
				| Ok(notification) => {
					debug!(notification = ?notification, "bootstrap notification");
				}
				| Err(err) => {
					debug!(error = %err, "MQTT connection error during bootstrap");
					return Err(BrokerError::connection(err.to_string()));
				}
			}
		}
	}

	/// Main event loop: dispatches incoming publishes to registered
	/// callbacks and observes connection lifecycle. Terminates naturally
	/// on an incoming or outgoing Disconnect packet.
	async fn run(
		mut event_loop: EventLoop,
		client: AsyncClient,
		callbacks: Arc<CallbackTable>,
		monitor: Arc<ConnectionMonitor>,
		subscribe_qos: rumqttc::QoS,
	) {
		let mut error_count = 0;
		loop {
			match event_loop.poll().await {
				| Ok(Incoming(Packet::ConnAck(ConnAck {
					session_present: false,
					code: ConnectReturnCode::Success,
				}))) => {
					error_count = 0;
					monitor.observe(ConnectionEvent::Connected);
					Self::resubscribe_all(
						&client,
						&callbacks,
						subscribe_qos,
					)
					.await;
				}
				| Ok(Incoming(Packet::ConnAck(ConnAck {
					session_present: true,
					code: ConnectReturnCode::Success,
				}))) => {
					error_count = 0;
					info!(
						"MQTT reconnected with session preserved, \
						 subscriptions maintained by broker"
					);
					monitor.observe(ConnectionEvent::Connected);
				}
				| Ok(Incoming(Publish(publish))) => {
					error_count = 0;
					debug!(
						topic = %publish.topic,
						payload_size = publish.payload.len(),
						"received MQTT message"
					);
					let topic = ArcStr::from(publish.topic.as_str());
					match callbacks.get(&topic) {
						| Some(callback) => callback(Delivery {
							topic: topic.clone(),
							payload: publish.payload,
							metadata: Metadata::for_topic(topic),
						}),
						| None => {
							debug!(
								topic = %topic,
								"message on topic with no registered callback"
							);
						}
					}
				}
				| Ok(Incoming(Disconnect)) => {
					info!("received MQTT Disconnect packet from server");
					break;
				}
				| Ok(Outgoing(rumqttc::Outgoing::Disconnect)) => {
					info!("sent MQTT Disconnect packet to server");
					break;
				}
				| Ok(notification) => {
					error_count = 0;
					debug!(notification = ?notification, "MQTT notification");
				}
				| Err(err) => {
					error_count += 1;
					error!(
						error_count = error_count,
						error = %err,
						"MQTT event loop error"
					);
					monitor.observe(ConnectionEvent::Reconnecting);

					if error_count >= MAX_CONSECUTIVE_ERRORS {
						error!(
							error_count = error_count,
							"too many consecutive errors, terminating \
							 event loop"
						);
						monitor.observe(ConnectionEvent::Disconnected);
						break;
					}

					// The transport retries on next poll; back off so a
					// dead broker does not spin the loop
					let delay = INITIAL_RETRY_DELAY
						* 2_u32.pow((error_count - 1).min(10));
					let delay = delay.min(MAX_RETRY_DELAY);
					warn!(delay = ?delay, "retrying MQTT connection");
					time::sleep(delay).await;
				}
			}
		}
		info!("MQTT event loop terminated");
	}

	/// Re-issue every active subscription after a reconnect that did not
	/// preserve the session.
	async fn resubscribe_all(
		client: &AsyncClient,
		callbacks: &CallbackTable,
		qos: rumqttc::QoS,
	) {
		let topics = callbacks.topics();
		if topics.is_empty() {
			return;
		}
		info!(
			topic_count = topics.len(),
			"MQTT reconnected without session, resubscribing to all topics"
		);
		let filters = topics
			.iter()
			.map(|topic| SubscribeFilter::new(topic.to_string(), qos))
			.collect::<Vec<_>>();
		if let Err(err) = client.subscribe_many(filters).await {
			error!(error = %err, "failed to resubscribe after reconnect");
		}
	}
}

#[async_trait]
impl Broker for MqttBroker {
	async fn subscribe(&self, topic: &str, callback: Callback) -> Result<()> {
		self.monitor.guard_open()?;
		validate_topic(topic)?;
		let previous = self.callbacks.insert(topic, callback);
		if let Err(err) = self
			.client
			.subscribe(topic, self.settings.subscribe_qos)
			.await
		{
			restore(&self.callbacks, topic, previous);
			return Err(classify(err));
		}
		Ok(())
	}

	async fn unsubscribe(&self, topic: &str) -> Result<()> {
		self.monitor.guard_open()?;
		if self.callbacks.remove(topic).is_none() {
			// Never subscribed in this instance
			return Ok(());
		}
		self.client.unsubscribe(topic).await.map_err(classify)
	}

	async fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
		self.monitor.guard_open()?;
		validate_topic(topic)?;
		let bytes = encode(payload, self.settings.encoding)?;
		self.client
			.publish_bytes(
				topic,
				self.settings.publish_qos,
				self.settings.retain,
				bytes,
			)
			.await
			.map_err(classify)
	}

	async fn close(&self) -> Result<()> {
		if !self.monitor.begin_close() {
			return Ok(());
		}
		let mut result = Ok(());
		let disconnected = match self.client.disconnect().await {
			| Ok(()) => true,
			| Err(err) => {
				warn!(error = %err, "failed to disconnect MQTT client");
				result = Err(classify(err));
				false
			}
		};
		let task = self
			.event_loop_task
			.lock()
			.expect("event loop task lock poisoned")
			.take();
		if let Some(task) = task {
			if disconnected {
				// Event loop exits after processing Outgoing(Disconnect)
				if let Err(err) = task.await {
					warn!(error = %err, "event loop task failed");
				}
			} else {
				task.abort();
			}
		}
		self.callbacks.clear();
		self.monitor.finish_close();
		result
	}

	fn state(&self) -> ConnectionState {
		self.monitor.state()
	}

	fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
		self.monitor.events()
	}

	/// One native multi-topic subscribe call registers the same callback
	/// for every topic in the batch.
	async fn subscribe_many(
		&self,
		topics: &[String],
		callback: Callback,
	) -> Result<()> {
		self.monitor.guard_open()?;
		if topics.is_empty() {
			return Ok(());
		}
		for topic in topics {
			validate_topic(topic)?;
		}
		let mut previous = Vec::with_capacity(topics.len());
		for topic in topics {
			previous
				.push((topic, self.callbacks.insert(topic, Arc::clone(&callback))));
		}
		let filters = topics
			.iter()
			.map(|topic| {
				SubscribeFilter::new(
					topic.clone(),
					self.settings.subscribe_qos,
				)
			})
			.collect::<Vec<_>>();
		if let Err(err) = self.client.subscribe_many(filters).await {
			for (topic, prior) in previous {
				restore(&self.callbacks, topic, prior);
			}
			return Err(classify(err));
		}
		Ok(())
	}
}

/// Append the configured client id when the URL does not carry one, then
/// parse the transport options.
fn parse_options(mut url: String, client_id: &str) -> Result<MqttOptions> {
	if !url.contains("client_id=") {
		url.push(if url.contains('?') { '&' } else { '?' });
		url.push_str("client_id=");
		url.push_str(client_id);
	}
	MqttOptions::parse_url(&url)
		.map_err(|err| BrokerError::protocol(err.to_string()))
}

/// Undo a speculative callback registration after a failed native call.
fn restore(
	callbacks: &CallbackTable,
	topic: &str,
	previous: Option<Callback>,
) {
	match previous {
		| Some(prior) => {
			callbacks.insert(topic, prior);
		}
		| None => {
			callbacks.remove(topic);
		}
	}
}

/// Topics are flat strings on this backend: wildcards would never match
/// the exact-topic dispatch table, so they are rejected up front.
fn validate_topic(topic: &str) -> Result<()> {
	if topic.is_empty() || topic.len() > 65535 {
		return Err(BrokerError::protocol(format!(
			"topic is empty or too long: {topic:?}"
		)));
	}
	if topic.chars().any(|c| matches!(c, '\0' | '#' | '+')) {
		return Err(BrokerError::protocol(format!(
			"topic contains illegal characters ('#', '+' or null byte): \
			 {topic:?}"
		)));
	}
	Ok(())
}

fn map_qos(qos: QosLevel) -> rumqttc::QoS {
	match qos {
		| QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
		| QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
		| QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
	}
}

/// Classify a transport error into the unified taxonomy.
///
/// A client error here means the request channel to the event loop is
/// unusable, which is a connection-level failure.
fn classify(err: rumqttc::ClientError) -> BrokerError {
	BrokerError::connection(err.to_string())
}
