/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::VecDeque;
use std::sync::Mutex;

struct Inner {
    chunks: VecDeque<String>,
    limit: Option<usize>,
}

/**
 * Accumulates the output of a job.  When a history limit is set, only the
 * most recent chunks are retained.
 */
pub struct LogBuffer {
    inner: Mutex<Inner>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        LogBuffer::unbounded()
    }
}

impl LogBuffer {
    pub fn unbounded() -> LogBuffer {
        LogBuffer::with_history(None)
    }

    pub fn bounded(limit: usize) -> LogBuffer {
        LogBuffer::with_history(Some(limit))
    }

    pub fn with_history(limit: Option<usize>) -> LogBuffer {
        LogBuffer {
            inner: Mutex::new(Inner {
                chunks: Default::default(),
                limit: limit.filter(|n| *n > 0),
            }),
        }
    }

    pub fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }

        let mut i = self.inner.lock().unwrap();
        i.chunks.push_back(chunk.to_string());
        if let Some(limit) = i.limit {
            while i.chunks.len() > limit {
                i.chunks.pop_front();
            }
        }
    }

    pub fn append_bytes(&self, chunk: &[u8]) {
        self.append(&String::from_utf8_lossy(chunk));
    }

    pub fn append_line(&self, line: &str) {
        self.append(&format!("{line}\n"));
    }

    pub fn snapshot(&self) -> String {
        self.inner.lock().unwrap().chunks.iter().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().chunks.is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().chunks.clear();
    }
}
