//! Keyed work queues and debounced dispatchers for background recomputation.
//!
//! Producers describe work as [`WorkItem`]s keyed by the unit they concern.
//! A [`KeyedWorkQueue`] coalesces pending items per key and hands out a
//! [`WorkLease`] for each taken item, guaranteeing at most one live lease per
//! key. A [`DebouncedDispatcher`] drains a queue after a per-[`WorkClass`]
//! backoff window and runs a [`WorkHandler`] for every taken item.

mod class;
mod config;
mod dispatcher;
mod item;
mod listener;
mod queue;
mod spawn;
mod token;

pub use class::WorkClass;
pub use config::{BackoffConfig, DispatcherConfig};
pub use dispatcher::{DebouncedDispatcher, DispatcherEvent, DispatcherState, HandlerError, PrioritySource, WorkHandler};
pub use item::{ChangeReasons, WorkItem, WorkScope};
pub use listener::{AsyncListener, AsyncToken};
pub use queue::{InsertionOrder, KeyedWorkQueue, TakePriority};
pub use spawn::{join_error_panic_message, spawn, spawn_blocking};
pub use token::WorkLease;
