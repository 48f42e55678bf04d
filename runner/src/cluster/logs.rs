/*
 * Copyright 2024 Oxide Computer Company
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use slog::{debug, info, warn, Logger};
use tokio::task::JoinHandle;

use super::api::ClusterApi;
use crate::logbuf::LogBuffer;

/**
 * Collects the output of a job pod.  The pod log cannot be followed until the
 * container has started, so the collector is attached by the watcher once the
 * pod is seen to be complete, and at most once.
 */
pub struct LogCollector {
    log: Logger,
    api: Arc<dyn ClusterApi>,
    namespace: String,
    pod: String,
    output: Arc<LogBuffer>,
    attached: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogCollector {
    pub fn new(
        log: &Logger,
        api: Arc<dyn ClusterApi>,
        namespace: &str,
        pod: &str,
        history: Option<usize>,
    ) -> LogCollector {
        LogCollector {
            log: log.clone(),
            api,
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            output: Arc::new(LogBuffer::with_history(history)),
            attached: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /**
     * Begin following the pod log, unless we already are.  If the log cannot
     * be opened, a later call may try again.
     */
    pub fn attach(&self) {
        if self.attached.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(self.log, "collecting pod log");

        let log = self.log.clone();
        let api = Arc::clone(&self.api);
        let namespace = self.namespace.clone();
        let pod = self.pod.clone();
        let output = Arc::clone(&self.output);
        let attached = Arc::clone(&self.attached);

        let t = tokio::spawn(async move {
            let mut s = match api.follow_log(&namespace, &pod).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(log, "could not follow pod log: {e}");
                    attached.store(false, Ordering::SeqCst);
                    return;
                }
            };

            while let Some(chunk) = s.next().await {
                match chunk {
                    Ok(b) => output.append_bytes(&b),
                    Err(e) => {
                        warn!(log, "pod log interrupted: {e}");
                        return;
                    }
                }
            }

            debug!(log, "pod log complete");
        });

        if let Some(old) = self.task.lock().unwrap().replace(t) {
            old.abort();
        }
    }

    /**
     * Wait a bounded time for the log to be read to its end.
     */
    pub async fn drain(&self, limit: Duration) {
        let t = self.task.lock().unwrap().take();
        if let Some(mut t) = t {
            if tokio::time::timeout(limit, &mut t).await.is_err() {
                warn!(self.log, "pod log still open after {limit:?}");
                t.abort();
            }
        }
    }

    pub fn output(&self) -> String {
        self.output.snapshot()
    }

    pub fn close(&self) {
        if let Some(t) = self.task.lock().unwrap().take() {
            t.abort();
        }
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        self.close();
    }
}
