//! Rate-limiting primitives shared by the REST and gateway sides.

pub mod global;
pub mod sequential;
pub mod token_bucket;

pub use global::GlobalGate;
pub use sequential::{BucketUpdate, SequentialBucket};
pub use token_bucket::TokenBucket;
