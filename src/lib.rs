//! # Corriere
//!
//! A minimal message broker: topics are append-only logs of (metadata, body)
//! records addressable by a monotonically increasing offset; independent
//! consumer groups track their own read position per topic; producers and
//! consumers reach the broker over TCP with a small length-prefixed envelope
//! protocol.
//!
//! ## Architecture
//!
//! - **Execution guard**: shutdown-safe enter/exit bracketing shared by the
//!   storage and network layers ([`infrastructure::guard`])
//! - **Topic log**: segmented record files plus a topic-global offset index
//!   and per-group cursors ([`infrastructure::topic`])
//! - **Broker**: topic registry and delegation ([`infrastructure::broker`])
//! - **Envelope protocol**: 18-byte header + metadata + body
//!   ([`infrastructure::protocol`])
//! - **Socket client/server**: one read loop per connection, one accept
//!   loop per bound address ([`infrastructure::client`],
//!   [`infrastructure::server`])
//!
//! ## Usage
//!
//! ```no_run
//! use corriere::infrastructure::MessageBroker;
//! use corriere::settings::BrokerSettings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let broker = MessageBroker::new(BrokerSettings::default());
//!     let (offset, _timestamp) = broker
//!         .produce("orders", "order-created", b"order #42")?
//!         .expect("broker is running");
//!     assert_eq!(offset, 0);
//!     broker.stop()?;
//!     Ok(())
//! }
//! ```

pub mod domain;
pub mod infrastructure;
pub mod settings;

pub use domain::{BrokerError, GroupName, Message, Result, TopicName, TopicStats};
pub use infrastructure::broker::MessageBroker;
pub use infrastructure::client::{ClientEvents, SocketClient};
pub use infrastructure::guard::ExecutionGuard;
pub use infrastructure::handler::BrokerHandler;
pub use infrastructure::protocol::MessageHeader;
pub use infrastructure::server::SocketServer;
pub use infrastructure::topic::Topic;
pub use settings::BrokerSettings;
