//! # Nimbus - Message Bus Runtime Core
//!
//! Nimbus mediates four interaction patterns over a backing queue/topic
//! transport: fire-and-forget commands, competing events, multicast events
//! and correlated request/response. The crate is the dispatch, correlation
//! and broker-plumbing engine between user-authored handlers and the
//! transport driver; wire-level framing, dependency-injection containers and
//! configuration loading stay outside.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use nimbus::bus::{Bus, BusConfig, HandlerRegistration, InMemoryTransport};
//! use nimbus::bus::{BusMessage, CommandHandler, DispatchContext};
//! use nimbus::HandlerError;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct PlaceOrder { id: u64 }
//!
//! impl BusMessage for PlaceOrder {
//!     const MESSAGE_TYPE: &'static str = "orders.placeorder";
//! }
//!
//! struct PlaceOrderHandler;
//!
//! #[async_trait::async_trait]
//! impl CommandHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, command: PlaceOrder, _: &DispatchContext) -> Result<(), HandlerError> {
//!         println!("placing order {}", command.id);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Bus::builder()
//!     .with_config(BusConfig::for_application("orders", "orders-1")?)
//!     .with_transport(Arc::new(InMemoryTransport::new()))
//!     .with_handlers(HandlerRegistration::new().handle_command(|_| PlaceOrderHandler))
//!     .build()?;
//!
//! bus.start().await?;
//! bus.send(PlaceOrder { id: 7 }).await?;
//! bus.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread safety
//!
//! Every component is safe for concurrent use: entity known-sets mutate only
//! under per-path locks, the correlator gives each outstanding request its
//! own completion primitive, and dependency scopes are opened per dispatch
//! and per send with guaranteed release on all exit paths.

pub mod bus;
pub mod domain_types;
pub mod error;
pub mod time_provider;

pub use bus::{Bus, BusBuilder, BusConfig};
pub use domain_types::{ApplicationName, InstanceName};
pub use error::{BusError, HandlerError};
pub use time_provider::{Clock, SharedClock, SystemClock, TestClock, system_clock, test_clock};
