//! Rate limiting logic and state management.

mod bucket;
mod janitor;
mod registry;

pub use bucket::{default_burst, BucketParams, Limiter, TokenBucket};
pub use janitor::{
    default_cleanup_interval, default_idle_threshold, Janitor, JanitorState, MAX_CLEANUP_INTERVAL,
};
pub use registry::{token_bucket_factory, ClientRecord, ClientRegistry, LimiterFactory};
