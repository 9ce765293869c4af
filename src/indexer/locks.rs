//! Per-file write serialization shared by concurrent runs.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

type Key = (String, String);

/// Async mutexes keyed by (project, path). Clone to share between runs.
#[derive(Clone, Default)]
pub struct FileLocks {
    inner: Arc<Mutex<HashMap<Key, Arc<TokioMutex<()>>>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to one file of one project.
    pub async fn lock(&self, project_id: &str, path: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on.
            table.retain(|_, m| Arc::strong_count(m) > 1);
            table
                .entry((project_id.to_string(), path.to_string()))
                .or_default()
                .clone()
        };
        mutex.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
