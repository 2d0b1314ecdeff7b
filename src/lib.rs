//! # SmithyMQ
//!
//! A Redis-backed message queue engine for Rust applications.
//!
//! ## Features
//!
//! - **Queue Types**: LIFO, FIFO and PRIORITY queues
//! - **Delivery Models**: point-to-point and pub/sub with consumer groups
//! - **Reliable Delivery**: acknowledgements, retries, delays and dead-lettering
//! - **Scheduling**: delayed, repeated and cron-driven messages
//! - **Queue Locks**: lock-guarded purges with orphaned lock recovery
//! - **Observability**: structured logging and an event bus
//!
//! All multi-key state changes run as Lua scripts or WATCH/MULTI
//! transactions, so the per-queue message counters always add up.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smithymq::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> SmithyResult<()> {
//!     let smithy = Smithy::new(SmithyConfig::default()).await?;
//!     smithy.start().await?;
//!
//!     let queue = QueueParams::new("emails", "app")?;
//!     smithy
//!         .queues()
//!         .create_queue(&queue, QueueType::Fifo, DeliveryModel::PointToPoint)
//!         .await?;
//!
//!     smithy
//!         .producer()
//!         .produce(ProducibleMessage::new(json!({"to": "user@example.com"})).set_queue(queue.clone()))
//!         .await?;
//!
//!     let mut consumer = smithy.consumer();
//!     consumer.consume(
//!         &queue,
//!         None,
//!         handler_fn(|message: MessageEnvelope| async move {
//!             println!("sending {}", message.message.body);
//!             Ok::<_, HandlerError>(())
//!         }),
//!     )?;
//!     consumer.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod core;
pub mod error;
pub mod events;
pub mod keys;
pub mod logging;
pub mod message;
pub mod producer;
pub mod queue;
pub mod redis_client;
pub mod storage;
pub mod utils;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::consumer::{Consumer, HandlerError, MessageHandler, handler_fn};
    pub use crate::core::Smithy;
    pub use crate::error::{SmithyError, SmithyResult};
    pub use crate::events::{BroadcastEventBus, EventBus, SharedEventBus, SmithyEvent};
    pub use crate::message::{
        MessageEnvelope, MessageId, MessageSchedule, MessageStatus, ProducibleMessage,
        UnacknowledgeReason,
    };
    pub use crate::producer::Producer;
    pub use crate::queue::{DeliveryModel, QueueParams, QueueRateLimit, QueueType};
    pub use async_trait::async_trait;
}

pub use crate::config::SmithyConfig;
pub use crate::core::Smithy;
pub use crate::error::{SmithyError, SmithyResult};
pub use async_trait::async_trait;
