//! LLM provider client: HTTP transport, transient/terminal classification,
//! bounded backoff, and rate limiting.

pub mod backoff;
pub mod client;
pub mod error;
pub mod rate_limiter;

pub use backoff::Backoff;
pub use client::HttpLlmClient;
pub use error::LlmApiError;
pub use rate_limiter::TokenBucketRateLimiter;
