//! Profile source contracts, the quota-guarded source client, and the
//! concrete sources the pipeline ships with.

pub mod client;
pub mod http;
pub mod registry;
pub mod source;

pub const CRATE_NAME: &str = "shadow-sources";

pub use client::{ClientConfig, FetchOutcome, QuotaWaitPolicy, RateLimitOrigin, SourceClient, SourceError};
pub use http::{HttpProfileSource, HttpSourceSettings};
pub use registry::{SourceConfig, SourceKind, SourceRegistry};
pub use source::{FixtureProfileSource, ProfileSource, SourceFailure};
