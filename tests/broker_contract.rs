//! Contract tests for the unified broker interface.
//!
//! Runs the trait's provided batch operations and close semantics against
//! an in-memory implementation that loops published messages back to the
//! registered callbacks, so no live backend is needed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use polybus::lifecycle::{ConnectionEvent, ConnectionMonitor};
use polybus::registry::CallbackTable;
use polybus::{
	Broker, BrokerError, Callback, ConnectionState, Delivery, Metadata,
	Payload,
};
use serde_json::json;

/// Payload that the in-memory broker refuses to deliver.
const POISON: &[u8] = b"boom";

/// Loopback broker: publishes are recorded and dispatched synchronously
/// to the callback registered for the topic.
struct MemoryBroker {
	callbacks: CallbackTable,
	monitor: ConnectionMonitor,
	published: Mutex<Vec<(String, Bytes)>>,
	rejected_topics: HashSet<String>,
}

impl MemoryBroker {
	fn new() -> Self {
		let monitor = ConnectionMonitor::new();
		monitor.observe(ConnectionEvent::Connected);
		Self {
			callbacks: CallbackTable::new(),
			monitor,
			published: Mutex::new(Vec::new()),
			rejected_topics: HashSet::new(),
		}
	}

	fn rejecting_topics<const N: usize>(topics: [&str; N]) -> Self {
		let mut broker = Self::new();
		broker.rejected_topics =
			topics.iter().map(|t| t.to_string()).collect();
		broker
	}

	fn published(&self) -> Vec<(String, Bytes)> {
		self.published.lock().unwrap().clone()
	}

	fn encode(payload: Payload) -> Result<Bytes, BrokerError> {
		match payload {
			| Payload::Bytes(bytes) => Ok(bytes),
			| Payload::Json(value) => Ok(Bytes::from(
				serde_json::to_vec(&value)
					.map_err(|e| BrokerError::serialization(e.to_string()))?,
			)),
		}
	}
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
	async fn subscribe(
		&self,
		topic: &str,
		callback: Callback,
	) -> Result<(), BrokerError> {
		self.monitor.guard_open()?;
		if self.rejected_topics.contains(topic) {
			return Err(BrokerError::protocol(format!(
				"subscription rejected: {topic}"
			)));
		}
		self.callbacks.insert(topic, callback);
		Ok(())
	}

	async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
		self.monitor.guard_open()?;
		self.callbacks.remove(topic);
		Ok(())
	}

	async fn publish(
		&self,
		topic: &str,
		payload: Payload,
	) -> Result<(), BrokerError> {
		self.monitor.guard_open()?;
		let bytes = Self::encode(payload)?;
		if bytes.as_ref() == POISON {
			return Err(BrokerError::protocol("delivery refused"));
		}
		self.published
			.lock()
			.unwrap()
			.push((topic.to_string(), bytes.clone()));
		if let Some(callback) = self.callbacks.get(topic) {
			callback(Delivery {
				topic: topic.into(),
				payload: bytes,
				metadata: Metadata::for_topic(topic),
			});
		}
		Ok(())
	}

	async fn close(&self) -> Result<(), BrokerError> {
		if !self.monitor.begin_close() {
			return Ok(());
		}
		self.callbacks.clear();
		self.monitor.finish_close();
		Ok(())
	}

	fn state(&self) -> ConnectionState {
		self.monitor.state()
	}

	fn events(
		&self,
	) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
		self.monitor.events()
	}
}

fn collecting_callback(sink: Arc<Mutex<Vec<Delivery>>>) -> Callback {
	Arc::new(move |delivery| {
		sink.lock().unwrap().push(delivery);
	})
}

#[tokio::test]
async fn subscribed_callback_receives_payload_and_topic() {
	let broker: Box<dyn Broker> = Box::new(MemoryBroker::new());
	let received = Arc::new(Mutex::new(Vec::new()));

	broker
		.subscribe("orders.created", collecting_callback(Arc::clone(&received)))
		.await
		.unwrap();
	broker
		.publish("orders.created", Payload::from(json!({"id": 1})))
		.await
		.unwrap();

	let received = received.lock().unwrap();
	assert_eq!(received.len(), 1);
	assert_eq!(received[0].topic, "orders.created");
	assert_eq!(received[0].metadata.topic, "orders.created");
	assert_eq!(received[0].payload_json().unwrap(), json!({"id": 1}));
}

#[tokio::test]
async fn second_subscribe_replaces_the_first_callback() {
	let broker = MemoryBroker::new();
	let first = Arc::new(Mutex::new(Vec::new()));
	let second = Arc::new(Mutex::new(Vec::new()));

	broker
		.subscribe("jobs", collecting_callback(Arc::clone(&first)))
		.await
		.unwrap();
	broker
		.subscribe("jobs", collecting_callback(Arc::clone(&second)))
		.await
		.unwrap();
	broker
		.publish("jobs", Payload::from("payload"))
		.await
		.unwrap();

	assert!(first.lock().unwrap().is_empty());
	assert_eq!(second.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unsubscribe_of_unknown_topic_is_a_no_op() {
	let broker = MemoryBroker::new();
	assert!(broker.unsubscribe("never-subscribed").await.is_ok());
}

#[tokio::test]
async fn publish_many_reports_failure_but_keeps_successes() {
	let broker = MemoryBroker::new();

	let payloads = vec![
		Payload::from("first"),
		Payload::Bytes(Bytes::from_static(POISON)),
		Payload::from("third"),
	];
	let err = broker
		.publish_many("orders", payloads)
		.await
		.unwrap_err();
	assert!(matches!(err, BrokerError::Protocol(_)));

	// The non-failing publishes stay applied; nothing is rolled back
	let published = broker.published();
	let delivered: Vec<&str> = published
		.iter()
		.map(|(_, bytes)| std::str::from_utf8(bytes).unwrap())
		.collect();
	assert_eq!(delivered.len(), 2);
	assert!(delivered.contains(&"first"));
	assert!(delivered.contains(&"third"));
}

#[tokio::test]
async fn subscribe_many_registers_one_callback_for_every_topic() {
	let broker = MemoryBroker::new();
	let received = Arc::new(Mutex::new(Vec::new()));

	let topics: Vec<String> =
		["alpha", "beta", "gamma"].iter().map(|s| s.to_string()).collect();
	broker
		.subscribe_many(&topics, collecting_callback(Arc::clone(&received)))
		.await
		.unwrap();

	for topic in &topics {
		broker
			.publish(topic, Payload::from(topic.as_str()))
			.await
			.unwrap();
	}
	assert_eq!(received.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn subscribe_many_partial_failure_keeps_accepted_subscriptions() {
	let broker = MemoryBroker::rejecting_topics(["beta"]);
	let received = Arc::new(Mutex::new(Vec::new()));

	let topics: Vec<String> =
		["alpha", "beta", "gamma"].iter().map(|s| s.to_string()).collect();
	let err = broker
		.subscribe_many(&topics, collecting_callback(Arc::clone(&received)))
		.await
		.unwrap_err();
	assert!(matches!(err, BrokerError::Protocol(_)));

	broker.publish("alpha", Payload::from("a")).await.unwrap();
	broker.publish("gamma", Payload::from("g")).await.unwrap();
	assert_eq!(received.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn unsubscribe_many_cancels_every_topic() {
	let broker = MemoryBroker::new();
	let received = Arc::new(Mutex::new(Vec::new()));

	let topics: Vec<String> =
		["one", "two"].iter().map(|s| s.to_string()).collect();
	broker
		.subscribe_many(&topics, collecting_callback(Arc::clone(&received)))
		.await
		.unwrap();
	broker.unsubscribe_many(&topics).await.unwrap();

	broker.publish("one", Payload::from("x")).await.unwrap();
	broker.publish("two", Payload::from("y")).await.unwrap();
	assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn operations_after_close_fail_with_closed() {
	let broker = MemoryBroker::new();
	broker.close().await.unwrap();

	let callback: Callback = Arc::new(|_| {});
	assert!(matches!(
		broker.subscribe("t", callback).await,
		Err(BrokerError::Closed)
	));
	assert!(matches!(
		broker.publish("t", Payload::from("x")).await,
		Err(BrokerError::Closed)
	));
	assert!(matches!(
		broker.unsubscribe("t").await,
		Err(BrokerError::Closed)
	));
}

#[tokio::test]
async fn close_is_idempotent() {
	let broker = MemoryBroker::new();
	assert!(broker.close().await.is_ok());
	// Second close completes successfully without side effects
	assert!(broker.close().await.is_ok());
	assert_eq!(broker.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn lifecycle_events_reach_host_listeners() {
	let broker = MemoryBroker::new();
	let mut events = broker.events();

	broker.close().await.unwrap();
	assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
}
