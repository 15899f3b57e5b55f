//! Dispatch core for a distributed publish/subscribe relay: URI-prefix
//! routing, a subscription registry, the dispatcher that ties them
//! together, per-recipient delivery queues, and the chaining protocol that
//! links multiple relays into one topology.
//!
//! `relay-http` adapts this crate's [`Dispatcher`] onto HTTP; `relay-server`
//! wires configuration, the outbound transport, and chaining startup around
//! it.

pub mod chaining;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod outbound;
pub mod prefix_map;
pub mod queue;
pub mod registry;
pub mod subscription;
pub mod subscription_set;
pub mod uri;
pub mod xml;

pub use chaining::{start_chaining, ChainingRetry};
pub use config::RelayConfig;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use event::DispatchEvent;
pub use outbound::{DeliveryOutcome, HttpResponse, Method, Outbound, ReqwestOutbound};
pub use prefix_map::PrefixMap;
pub use queue::repository::QueueRepository;
pub use registry::Registry;
pub use subscription::{Cookie, Subscription};
pub use subscription_set::SubscriptionSet;
pub use uri::Uri;
