//! Message transport core for IoT Hub device and service clients
//!
//! Applications queue device to cloud messages with a completion callback;
//! a periodically scheduled send task hands them to the active transport and
//! invokes every callback exactly once with the outcome. A receive task polls
//! for cloud to device messages the same way.
//!
//! ## Feature flags
//!
//! - `https` (default): HTTPS transport backed by hyper
//! - `mqtt` (default): MQTT transport over TLS
//!
//! The AMQP transport and feedback receiver are always available; the
//! connection itself comes from an [`amqp::AmqpEndpoint`] implementation.
//!
//! # Examples
//!
//! A simple client
//! ```no_run
//! use iothub_transport::{DeviceClient, Message, Protocol};
//! use tokio::time;
//!
//! #[tokio::main]
//! async fn main() -> iothub_transport::Result<()> {
//!     let mut client = DeviceClient::builder()
//!         .iothub_details("iothubname.azure-devices.net", "MyDeviceId")
//!         .access_key("TheAccessKey")?
//!         .protocol(Protocol::Https)
//!         .build()
//!         .expect("valid configuration");
//!     client.open().await?;
//!
//!     let mut interval = time::interval(time::Duration::from_secs(1));
//!     for count in 0..10u32 {
//!         interval.tick().await;
//!
//!         let msg = Message::builder()
//!             .set_body(format!("Message #{}", count).as_bytes().to_vec())
//!             .set_message_id(format!("{}-t", count))
//!             .build();
//!
//!         client.send_event_async(msg, |status, count| {
//!             println!("message {} completed with {}", count, status);
//!         }, count)?;
//!     }
//!
//!     client.close().await
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// IoT SDK package version
pub const SDK_VERSION: &str = std::env!("CARGO_PKG_VERSION");

/// Value of the `user-agent` header sent to the hub
pub const USER_AGENT: &str = concat!("iothub-transport-rs/", env!("CARGO_PKG_VERSION"));

pub mod amqp;
/// The device client
pub mod client;
/// Typestate builder for the device client
pub mod client_builder;
/// Errors
pub mod error;
pub mod https;
/// Message types for communicating with the IoT Hub
pub mod message;
/// MQTT device transport
#[cfg(feature = "mqtt")]
pub mod mqtt_transport;
pub mod native;
pub mod status;
pub mod task;
pub mod token;
/// Transport types
pub mod transport;

pub use amqp::feedback::{FeedbackBatch, FeedbackReceiver, FeedbackRecord};
pub use client::{DeviceClient, DeviceClientConfig};
pub use client_builder::{DeviceClientBuilder, DeviceClientBuilderError};
pub use error::{Error, Result};
pub use message::{Message, MessageBuilder, MessageResult};
pub use status::{map_status, HubError, IotHubStatusCode};
pub use task::{schedule, ReceiveTask, ScheduledTask, SendTask, Tick};
pub use token::{DeviceKeyTokenSource, SasToken, SasTokenSource, ServiceSasTokenSource, TokenSource};
pub use transport::{OutboundPacket, Protocol, Transport, TransportConfig, TransportQueues, TransportState};
