//! Buffered S3 object-store sink.
//!
//! Events accumulate in per-key in-memory buffers and are uploaded as
//! newline-delimited JSON objects named
//! `<root>/<key>/<utc timestamp>-<agent uuid>.jsonl`. A buffer flushes when
//! it reaches its event cap, at the end of a batch when `flush_on_batch` is
//! set, from the periodic flusher task, or on shutdown.

mod buffer;
mod client;
mod sink;

pub use buffer::BufferSet;
pub use client::{AwsS3Client, ObjectStoreClient, UploadPolicy};
pub use sink::{S3EventSink, S3RawSink, S3SinkConfig, spawn_periodic_flush};
