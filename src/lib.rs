//! Devgate - a development proxy that keeps its backend up to date
//!
//! This library provides a reverse proxy that:
//! - Rebuilds the backend when its inputs were marked dirty since the last build
//! - Restarts the backend when the binary was rebuilt since it last started
//! - Forwards a request only once the backend is current and reachable
//! - Replays a failed build as an HTML error page until the next dirty signal
//! - Accepts dirty signals over HTTP from a separate watcher process

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod notifier;
pub mod pool;
pub mod proxy;
pub mod render;
pub mod runner;
pub mod waiter;
