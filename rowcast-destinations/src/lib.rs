//! Concrete sink implementations for the rowcast agent.
//!
//! The buffered S3 sink aggregates newline-delimited JSON per key before
//! uploading; the PostHog, Amplitude and Mixpanel sinks post batches to the
//! provider HTTP APIs; the BigQuery sinks stream rows through the insertAll
//! API. Everything implements the sink traits from the core crate.

pub mod amplitude;
pub mod bigquery;
pub mod mixpanel;
pub mod posthog;
pub mod s3;
