//! Rate limiting logic and state management.

mod bucket;
mod key;
mod policy;
mod registry;

pub use bucket::{Admission, LeakyBucket};
pub use key::RateLimitKey;
pub use policy::{
    forwarded_chain, forwarded_chain_bytes, AdmissionPolicy, BucketParams, RequestClass,
    X_FORWARDED_FOR,
};
pub use registry::BucketRegistry;
