use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

/// Timestamp component of object keys, e.g. `20240501T120000Z`.
const OBJECT_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug)]
struct ObjectBuffer {
    object_key: String,
    data: Vec<u8>,
    events: usize,
}

/// Per-key in-memory buffers guarded by a single mutex.
///
/// Each buffer is born with its final object key
/// (`<root>/<key>/<utc timestamp>-<agent uuid>.jsonl`, with the agent uuid
/// stable for the process lifetime) and is removed wholesale when taken for
/// upload, so the next write under the same key starts a fresh object.
#[derive(Debug)]
pub struct BufferSet {
    buffers: Mutex<HashMap<String, ObjectBuffer>>,
    root: String,
    agent_id: Uuid,
    max_events_per_file: usize,
}

impl BufferSet {
    pub fn new(root: impl Into<String>, max_events_per_file: usize) -> BufferSet {
        BufferSet {
            buffers: Mutex::new(HashMap::new()),
            root: root.into().trim_matches('/').to_string(),
            agent_id: Uuid::new_v4(),
            max_events_per_file,
        }
    }

    /// Appends one encoded line under `key`; returns true when the buffer
    /// reached its event cap and should be flushed.
    pub fn append(&self, key: &str, line: &[u8]) -> bool {
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers
            .entry(key.to_string())
            .or_insert_with(|| ObjectBuffer {
                object_key: self.object_key(key),
                data: Vec::new(),
                events: 0,
            });

        buffer.data.extend_from_slice(line);
        buffer.data.push(b'\n');
        buffer.events += 1;
        buffer.events >= self.max_events_per_file
    }

    /// Removes a key's buffer for upload. Returns nothing when the buffer is
    /// absent or empty; the upload itself happens outside the lock.
    pub fn take(&self, key: &str) -> Option<(String, Vec<u8>)> {
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers.remove(key)?;
        if buffer.events == 0 {
            return None;
        }
        Some((buffer.object_key, buffer.data))
    }

    /// Removes every non-empty buffer for upload.
    pub fn drain_all(&self) -> Vec<(String, Vec<u8>)> {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .drain()
            .filter(|(_, buffer)| buffer.events > 0)
            .map(|(_, buffer)| (buffer.object_key, buffer.data))
            .collect()
    }

    /// Keys that currently hold buffered events.
    pub fn pending_keys(&self) -> Vec<String> {
        self.buffers.lock().unwrap().keys().cloned().collect()
    }

    fn object_key(&self, key: &str) -> String {
        let timestamp = Utc::now().format(OBJECT_TIMESTAMP_FORMAT);
        let file = format!("{timestamp}-{}.jsonl", self.agent_id);
        if self.root.is_empty() {
            format!("{key}/{file}")
        } else {
            format!("{}/{key}/{file}", self.root)
        }
    }
}
