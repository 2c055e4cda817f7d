//! Backend adapters.
//!
//! One adapter per protocol family, each translating the unified
//! subscribe/publish contract into backend-native calls. Adapters are
//! selected at construction time through [`crate::connect`] and are
//! compiled in per feature flag.

/// Exchange-based adapter (AMQP 0.9.1)
#[cfg(feature = "amqp")]
pub mod amqp;
/// Flat-topic adapter (MQTT)
#[cfg(feature = "mqtt")]
pub mod mqtt;
/// Pattern pub/sub adapter (Redis)
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBroker;
#[cfg(feature = "redis")]
pub use redis::RedisBroker;
