#![doc = include_str!("../README.md")]

pub mod broker;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod http;
pub mod message;
pub mod propagation;
pub mod relay;
pub mod signals;
pub mod store;
pub mod telemetry;

#[doc(inline)]
pub use broker::{ProduceRequest, PublishError, Publisher};

#[doc(inline)]
pub use message::{MessageOutcome, NewOutboxMessage, OutboxMessage};

#[doc(inline)]
pub use relay::{Relay, RelayHandle};

#[doc(inline)]
pub use store::{with_tx, OutboxStore, Store, StoreError};
