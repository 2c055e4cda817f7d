//! Exchange-based adapter backed by AMQP 0.9.1.
//!
//! Every topic is materialized as a durable queue bound to a configurable
//! exchange. The per-topic channel is created lazily on first
//! `subscribe`/`publish` and cached in the topic registry; queue and
//! exchange declarations survive the adapter because durability is owned
//! by the backend, not by this process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arcstr::ArcStr;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
	BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
	ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
	QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{
	BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
	ExchangeKind,
};
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::broker::{Broker, Callback};
use crate::config::{BrokerConfig, ExchangeType};
use crate::error::{BrokerError, Result};
use crate::lifecycle::{ConnectionEvent, ConnectionMonitor, ConnectionState};
use crate::message::{encode, Delivery, Metadata, Payload, PayloadEncoding};
use crate::registry::{TopicEntry, TopicRegistry};

/// How long `close()` waits for consumer dispatch tasks to drain after
/// the connection has been torn down.
const CONSUMER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-topic backend handle: a dedicated channel with the queue declared,
/// bound to the exchange, plus the consumer dispatch task once a
/// subscription exists.
pub struct AmqpTopic {
	channel: Channel,
	consumer_started: OnceCell<()>,
	consumer_task: Mutex<Option<JoinHandle<()>>>,
}

/// Settings distilled from [`BrokerConfig`] at construction.
struct AmqpSettings {
	enable_ack: bool,
	exchange_name: String,
	exchange_kind: ExchangeKind,
	publish_timeout: Duration,
	encoding: PayloadEncoding,
	exclusive_consumer: bool,
	persistent: bool,
}

/// Exchange-based broker adapter.
pub struct AmqpBroker {
	connection: Connection,
	registry: TopicRegistry<AmqpTopic>,
	monitor: Arc<ConnectionMonitor>,
	settings: AmqpSettings,
}

impl AmqpBroker {
	/// Connect to the first reachable AMQP target in `config.urls`.
	pub async fn connect(config: BrokerConfig) -> Result<Self> {
		let monitor = Arc::new(ConnectionMonitor::new());
		monitor.begin_connect();

		let mut last_error =
			BrokerError::connection("no connection targets configured");
		let mut connection = None;
		for url in &config.urls {
			let properties = ConnectionProperties::default()
				.with_connection_name(config.client_id.as_str().into());
			let attempt = time::timeout(
				config.connect_timeout,
				Connection::connect(url, properties),
			)
			.await;
			match attempt {
				| Ok(Ok(conn)) => {
					connection = Some(conn);
					break;
				}
				| Ok(Err(err)) => {
					warn!(url = %url, error = %err, "AMQP connect attempt failed");
					last_error = classify(err);
				}
				| Err(_) => {
					warn!(
						url = %url,
						timeout = ?config.connect_timeout,
						"AMQP connect attempt timed out"
					);
					last_error = BrokerError::connection(format!(
						"connection attempt timed out after {:?}",
						config.connect_timeout
					));
				}
			}
		}
		let Some(connection) = connection else {
			monitor.observe(ConnectionEvent::ConnectFailed);
			return Err(last_error);
		};

		// Re-expose transport-driven lifecycle changes; reconnection policy
		// stays with the transport
		{
			let monitor = Arc::clone(&monitor);
			connection.on_error(move |err| {
				error!(error = %err, "AMQP connection error");
				monitor.observe(ConnectionEvent::Disconnected);
			});
		}
		monitor.observe(ConnectionEvent::Connected);

		Ok(Self {
			connection,
			registry: TopicRegistry::new(),
			monitor,
			settings: AmqpSettings {
				enable_ack: config.enable_ack,
				exchange_name: config.exchange_name.clone(),
				exchange_kind: exchange_kind(config.exchange_type),
				publish_timeout: config.publish_timeout,
				encoding: config.encoding,
				exclusive_consumer: config.consume.exclusive,
				persistent: config.publish.persistent,
			},
		})
	}

	/// Declare the per-topic channel, queue, exchange and binding.
	///
	/// Invoked through the registry's once-per-topic initialization, so
	/// concurrent first use converges on a single channel.
	async fn create_topic(&self, topic: &str) -> Result<AmqpTopic> {
		let channel =
			self.connection.create_channel().await.map_err(classify)?;
		if self.settings.enable_ack {
			channel
				.confirm_select(ConfirmSelectOptions::default())
				.await
				.map_err(classify)?;
		}
		channel
			.queue_declare(
				topic,
				QueueDeclareOptions {
					durable: true,
					..Default::default()
				},
				FieldTable::default(),
			)
			.await
			.map_err(classify)?;
		channel
			.exchange_declare(
				&self.settings.exchange_name,
				self.settings.exchange_kind.clone(),
				ExchangeDeclareOptions {
					durable: true,
					..Default::default()
				},
				FieldTable::default(),
			)
			.await
			.map_err(classify)?;
		channel
			.queue_bind(
				topic,
				&self.settings.exchange_name,
				topic,
				QueueBindOptions::default(),
				FieldTable::default(),
			)
			.await
			.map_err(classify)?;
		debug!(
			topic = %topic,
			exchange = %self.settings.exchange_name,
			"declared queue and binding"
		);
		Ok(AmqpTopic {
			channel,
			consumer_started: OnceCell::new(),
			consumer_task: Mutex::new(None),
		})
	}

	/// Dispatch deliveries from one consumer stream to the registered
	/// callback, acknowledging each delivery after the callback returns
	/// when acknowledgements are enabled.
	async fn consume_loop(
		mut consumer: Consumer,
		entry: Arc<TopicEntry<AmqpTopic>>,
		topic: ArcStr,
		enable_ack: bool,
	) {
		while let Some(delivery) = consumer.next().await {
			match delivery {
				| Ok(AmqpDelivery {
					delivery_tag,
					redelivered,
					data,
					acker,
					..
				}) => {
					let metadata = Metadata {
						topic: topic.clone(),
						delivery_tag: Some(delivery_tag),
						redelivered,
						pattern: None,
					};
					match entry.callback() {
						| Some(callback) => callback(Delivery {
							topic: topic.clone(),
							payload: Bytes::from(data),
							metadata,
						}),
						| None => {
							debug!(
								topic = %topic,
								delivery_tag = delivery_tag,
								"delivery with no registered callback"
							);
						}
					}
					if enable_ack {
						if let Err(err) =
							acker.ack(Default::default()).await
						{
							error!(
								topic = %topic,
								delivery_tag = delivery_tag,
								error = %err,
								"failed to acknowledge delivery"
							);
						}
					}
				}
				| Err(err) => {
					error!(topic = %topic, error = %err, "consumer stream error");
					break;
				}
			}
		}
		debug!(topic = %topic, "consumer stream ended");
	}
}

#[async_trait]
impl Broker for AmqpBroker {
	async fn subscribe(&self, topic: &str, callback: Callback) -> Result<()> {
		self.monitor.guard_open()?;
		let entry = self.registry.entry(topic);
		let handle = entry
			.handle_or_init(|| self.create_topic(topic))
			.await?;
		// Replaces any previously registered callback for this topic
		entry.set_callback(callback);

		let topic_key = ArcStr::from(topic);
		let enable_ack = self.settings.enable_ack;
		let exclusive = self.settings.exclusive_consumer;
		handle
			.consumer_started
			.get_or_try_init(|| async {
				let consumer = handle
					.channel
					.basic_consume(
						topic,
						// Consumer tag doubles as the cancellation key
						topic,
						BasicConsumeOptions {
							no_ack: !enable_ack,
							exclusive,
							..Default::default()
						},
						FieldTable::default(),
					)
					.await
					.map_err(classify)?;
				let task = tokio::spawn(Self::consume_loop(
					consumer,
					Arc::clone(&entry),
					topic_key,
					enable_ack,
				));
				*handle
					.consumer_task
					.lock()
					.expect("consumer task lock poisoned") = Some(task);
				Ok::<(), BrokerError>(())
			})
			.await?;
		Ok(())
	}

	async fn unsubscribe(&self, topic: &str) -> Result<()> {
		self.monitor.guard_open()?;
		let Some(entry) = self.registry.remove(topic) else {
			// Never subscribed in this instance
			return Ok(());
		};
		entry.clear_callback();
		if let Some(handle) = entry.handle() {
			if handle.consumer_started.get().is_some() {
				handle
					.channel
					.basic_cancel(topic, BasicCancelOptions::default())
					.await
					.map_err(classify)?;
			}
			// Queue and exchange declarations are left in place; only the
			// channel is released
			if let Err(err) = handle.channel.close(200, "unsubscribed").await
			{
				warn!(topic = %topic, error = %err, "failed to close topic channel");
			}
		}
		Ok(())
	}

	async fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
		self.monitor.guard_open()?;
		let bytes = encode(payload, self.settings.encoding)?;
		let entry = self.registry.entry(topic);
		let handle = entry
			.handle_or_init(|| self.create_topic(topic))
			.await?;

		let mut properties = BasicProperties::default();
		if self.settings.persistent {
			properties = properties.with_delivery_mode(2);
		}
		if self.settings.encoding == PayloadEncoding::Json {
			properties =
				properties.with_content_type("application/json".into());
		}

		let confirm = handle
			.channel
			.basic_publish(
				// Default exchange routes directly to the queue named by
				// the routing key
				"",
				topic,
				BasicPublishOptions::default(),
				&bytes,
				properties,
			)
			.await
			.map_err(classify)?;

		if self.settings.enable_ack {
			let confirmation =
				time::timeout(self.settings.publish_timeout, confirm)
					.await
					.map_err(|_| {
						BrokerError::Timeout(self.settings.publish_timeout)
					})?
					.map_err(classify)?;
			if let Confirmation::Nack(_) = confirmation {
				return Err(BrokerError::protocol(
					"broker negatively acknowledged publish",
				));
			}
		}
		Ok(())
	}

	async fn close(&self) -> Result<()> {
		if !self.monitor.begin_close() {
			return Ok(());
		}
		let mut drain_tasks = Vec::new();
		for (topic, entry) in self.registry.drain() {
			entry.clear_callback();
			if let Some(handle) = entry.handle() {
				if handle.consumer_started.get().is_some() {
					if let Err(err) = handle
						.channel
						.basic_cancel(
							topic.as_str(),
							BasicCancelOptions::default(),
						)
						.await
					{
						warn!(
							topic = %topic,
							error = %err,
							"failed to cancel consumer during close"
						);
					}
				}
				if let Some(task) = handle
					.consumer_task
					.lock()
					.expect("consumer task lock poisoned")
					.take()
				{
					drain_tasks.push(task);
				}
			}
		}

		let result = self
			.connection
			.close(200, "client shutdown")
			.await
			.map_err(classify);
		if let Err(err) = &result {
			warn!(error = %err, "graceful connection close failed");
		}

		// Consumer streams end once the connection is gone; give their
		// dispatch tasks a bounded window to finish in-flight callbacks
		let drain = async {
			for task in drain_tasks {
				let _ = task.await;
			}
		};
		if time::timeout(CONSUMER_DRAIN_TIMEOUT, drain).await.is_err() {
			warn!(
				timeout = ?CONSUMER_DRAIN_TIMEOUT,
				"consumer dispatch tasks did not drain in time"
			);
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

/// Map the configured exchange topology to the wire-level kind.
fn exchange_kind(exchange_type: ExchangeType) -> ExchangeKind {
	match exchange_type {
		| ExchangeType::Topic => ExchangeKind::Topic,
		| ExchangeType::Direct => ExchangeKind::Direct,
		| ExchangeType::Fanout => ExchangeKind::Fanout,
		| ExchangeType::Headers => ExchangeKind::Headers,
	}
}

/// Classify a transport error into the unified taxonomy.
fn classify(err: lapin::Error) -> BrokerError {
	match &err {
		| lapin::Error::ProtocolError(_)
		| lapin::Error::ParsingError(_)
		| lapin::Error::SerialisationError(_) => {
			BrokerError::protocol(err.to_string())
		}
		| _ => BrokerError::connection(err.to_string()),
	}
}
