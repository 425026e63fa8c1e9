#![warn(missing_docs)]

//! Request/reply correlation over a one-way queue transport.
//!
//! The crate turns a plain message broker into a call/return fabric: a
//! sender marshals a typed model, publishes it with a correlation id and a
//! temporary reply destination, and hands back a future that resolves when
//! the correlated reply arrives. On the serving side a dispatcher decodes
//! inbound messages, routes them to typed handlers, and sends results back
//! along the reply address with correlation and remaining lifetime intact.
//!
//! The broker sits behind the traits in [`transport`]; [`memory`] is the
//! in-process implementation used throughout the tests. [`codec`] holds the
//! model registry that maps between typed values and wire text, [`future`]
//! the correlation future, and [`replicator`] a bridge that forwards
//! messages across brokers.

pub mod codec;
pub mod error;
pub mod future;
pub mod listener;
pub mod memory;
pub mod message;
pub mod receiver;
pub mod replicator;
pub mod selector;
pub mod sender;
pub mod transport;
