//! Services for the BitMEX real-time depth server
//!
//! This crate holds the shared state (depth cache, subscription registry),
//! the fan-out of updates to subscribers and the server facade consumers
//! call into.

pub mod depth_cache;
pub mod dispatcher;
pub mod notifier;
pub mod server;
pub mod subscription;

pub use depth_cache::{DepthCache, DepthCacheStats};
pub use dispatcher::{FeedHealth, FeedMetrics, UpdateDispatcher};
pub use notifier::Notifier;
pub use server::{MarketDataServer, ServerConfig, ServerHealth};
pub use subscription::SubscriptionRegistry;
