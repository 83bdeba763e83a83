// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dynamically reconfigurable, low-overhead logging.
//!
//! `relog` keeps log call sites cheap enough to leave in production
//! code: a disabled site costs a relaxed atomic load and a branch, an
//! enabled one is competitive with direct formatted I/O, and the set
//! of enabled sites can be rewritten at runtime without restarting
//! the process.
//!
//! Four subsystems cooperate:
//!
//! * **Call sites** ([`CallSite`], [`relog!`]) — a process-lifetime
//!   record per site holding an atomically swappable sink reference
//!   and a level mask, checked inline before any argument formatting.
//! * **Messages** ([`Message`], [`Erasure`], [`Reflection`]) — typed
//!   heterogeneous closures over the captured arguments, serialized
//!   lazily and inspectable at runtime.
//! * **Configuration** ([`Configuration`], [`Policy`]) — a
//!   priority-ordered policy set that owns the sites and pushes
//!   enable/disable and destination changes into them.
//! * **Dispatch** ([`Dispatcher`](dispatch::Dispatcher),
//!   [`DeferredSink`](dispatch::DeferredSink)) — a latency-bounded
//!   queue decoupling producers from sink workers, with a flush
//!   barrier.
//!
//! # Quick start
//!
//! ```ignore
//! use relog::{relog, Level};
//!
//! relog!("startup", Level::Info, "listening on ", addr, ":", port);
//! ```
//!
//! Sites register themselves with the global [`configuration`] on
//! first use; the built-in [`default_policy`] sends everything to
//! standard output until told otherwise. Install higher-priority
//! [`PredicatePolicy`]s to redirect or silence subsets of sites at
//! runtime.

pub mod config;
pub mod dispatch;
pub mod erasure;
pub mod error;
pub mod global;
pub mod level;
#[macro_use]
pub mod macros;
pub mod message;
pub mod policy;
pub mod pool;
pub mod reflect;
pub mod sink;
pub mod site;
pub mod timestamp;

pub use config::Configuration;
pub use erasure::Erasure;
pub use error::{Error, Result};
pub use global::{configuration, default_policy, DEFAULT_PRIORITY};
pub use level::{Level, LevelLabel, LevelSet};
pub use message::{Arguments, Content, Element, Message, MessageBuilder};
pub use policy::{ChangeSet, DefaultPolicy, MatchAll, Policy, PredicatePolicy, SitePredicate};
pub use reflect::{Inspect, Reflection, TypeTraits};
pub use sink::{sink_ref, FdSink, NullSink, Sink, SinkRef};
pub use site::{CallSite, SiteRef};
pub use timestamp::{LazyTimestamp, Timestamp};
