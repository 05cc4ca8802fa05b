//! relay-bus — embeddable messaging middleware.
//!
//! Sits between application code and an exchangeable broker driver and
//! wraps a correctness envelope around it: reliable publish with
//! local-transaction coordination, at-least-once consumption with
//! idempotent delivery, bounded retry with delay, dead-letter capture
//! with periodic reinjection, and an orderly prepare/run/cancel/wait
//! lifecycle.
//!
//! The two central pieces are the [`Handler`] consumer pipeline and the
//! [`Sender`] transactional publisher; everything they touch at runtime
//! is polymorphic behind the contracts in [`interfaces`]. The
//! [`memory`] module ships a complete in-process reference driver and
//! stores for tests and single-process use.

pub mod facade;
pub mod handler;
pub mod interfaces;
pub mod memory;
pub mod message;
pub mod sender;

pub use facade::Bus;
pub use handler::{Handler, MessageFn, RetryDelayFn, Subscribe};
pub use interfaces::{
    DeadLetterStore, DeliveryFn, Driver, DriverError, Idempotent, Logger, NullDeadLetterStore,
    NullIdempotent, StoreError, TracingLogger, TxStore,
};
pub use memory::{MemoryDeadLetterStore, MemoryDriver, MemoryIdempotent, MemoryTxStore};
pub use message::{CodecError, Message};
pub use sender::{SendError, Sender, TxOptions};
