//! Persistent FIFO request queue backed by the key-value store.
//!
//! Layout under the queue namespace (e.g. `fetch:{run_id}`):
//! - `{ns}:items:{id}` -> serialized item, one per element
//! - `{ns}:next_id`    -> next write slot (monotonically increasing)
//! - `{ns}:size`       -> current element count
//!
//! Invariants: `size` equals the number of stored items, and the stored ids
//! are exactly the contiguous range `[next_id - size, next_id)`. On first
//! use per process the queue scans the item keyspace and rewrites the
//! counters when they disagree with what is actually stored, which makes the
//! queue consistent across restarts and partial failures.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{FetchError, Result};
use crate::kv::{KeyValueStore, KeyValueStoreExt, Serializer};

pub struct KvRequestQueue<T> {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
    serializer: Box<dyn Serializer<T>>,
    state: Mutex<QueueState>,
}

struct QueueState {
    initialized: bool,
}

impl<T: Send> KvRequestQueue<T> {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        namespace: impl Into<String>,
        serializer: Box<dyn Serializer<T>>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.trim().is_empty() {
            return Err(FetchError::configuration(
                "queue",
                "namespace must be a non-empty string",
            ));
        }
        Ok(KvRequestQueue {
            kv,
            namespace: namespace.trim().to_string(),
            serializer,
            state: Mutex::new(QueueState { initialized: false }),
        })
    }

    fn next_id_key(&self) -> String {
        format!("{}:next_id", self.namespace)
    }

    fn size_key(&self) -> String {
        format!("{}:size", self.namespace)
    }

    fn item_key(&self, id: u64) -> String {
        format!("{}:items:{}", self.namespace, id)
    }

    fn items_prefix(&self) -> String {
        format!("{}:items:", self.namespace)
    }

    async fn ensure_initialized(&self, state: &mut QueueState) -> Result<()> {
        if !state.initialized {
            self.recover_queue_state().await?;
            state.initialized = true;
        }
        Ok(())
    }

    /// Scan stored items and rewrite the counters when they disagree with
    /// the observed keyspace. Runs under the queue mutex.
    async fn recover_queue_state(&self) -> Result<()> {
        debug!(namespace = %self.namespace, "QUEUE_RECOVERY_STARTED");

        let stored_next_id = self.kv.get_u64(&self.next_id_key(), 0).await?;
        let stored_size = self.kv.get_u64(&self.size_key(), 0).await?;

        let prefix = self.items_prefix();
        let keys = self.kv.scan(&prefix).await?;

        let mut item_ids: Vec<u64> = Vec::with_capacity(keys.len());
        for key in &keys {
            match key.rsplit(':').next().and_then(|id| id.parse().ok()) {
                Some(id) => item_ids.push(id),
                None => {
                    warn!(namespace = %self.namespace, key = %key, "QUEUE_RECOVERY_INVALID_ITEM_KEY");
                }
            }
        }

        if item_ids.is_empty() {
            if stored_size > 0 || stored_next_id > 0 {
                warn!(
                    namespace = %self.namespace,
                    stored_size,
                    stored_next_id,
                    "QUEUE_RECOVERY_RESETTING_COUNTERS"
                );
                self.kv.put_u64(&self.next_id_key(), 0).await?;
                self.kv.put_u64(&self.size_key(), 0).await?;
            }
            return Ok(());
        }

        let actual_start_id = *item_ids.iter().min().unwrap_or(&0);
        let actual_end_id = *item_ids.iter().max().unwrap_or(&0) + 1;
        let actual_size = item_ids.len() as u64;

        let expected_start_id = stored_next_id.saturating_sub(stored_size);
        if actual_start_id != expected_start_id || actual_size != stored_size {
            warn!(
                namespace = %self.namespace,
                stored_size,
                stored_next_id,
                actual_size,
                actual_start_id,
                actual_end_id,
                "QUEUE_STATE_INCONSISTENCY_DETECTED"
            );
            self.kv.put_u64(&self.next_id_key(), actual_end_id).await?;
            self.kv.put_u64(&self.size_key(), actual_size).await?;
            debug!(namespace = %self.namespace, new_size = actual_size, "QUEUE_STATE_RECOVERED");
        }

        Ok(())
    }

    /// Append items in order. Either all items land with updated counters or
    /// every stored item is deleted again (compensating action).
    pub async fn enqueue(&self, items: Vec<T>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let mut next_id = self.kv.get_u64(&self.next_id_key(), 0).await?;
        let current_size = self.kv.get_u64(&self.size_key(), 0).await?;
        let count = items.len();

        let mut stored_ids: Vec<u64> = Vec::with_capacity(count);
        let write_result: Result<()> = async {
            for item in &items {
                let serialized = self.serializer.serialize(item)?;
                self.kv.put(&self.item_key(next_id), serialized, None).await?;
                stored_ids.push(next_id);
                next_id += 1;
            }
            self.kv.put_u64(&self.next_id_key(), next_id).await?;
            self.kv
                .put_u64(&self.size_key(), current_size + count as u64)
                .await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            for id in stored_ids {
                if let Err(rollback_err) = self.kv.delete(&self.item_key(id)).await {
                    warn!(
                        namespace = %self.namespace,
                        item_id = id,
                        error = %rollback_err,
                        "QUEUE_ENQUEUE_ROLLBACK_FAILED"
                    );
                }
            }
            return Err(err);
        }

        debug!(
            namespace = %self.namespace,
            count,
            new_size = current_size + count as u64,
            "QUEUE_ITEMS_ENQUEUED"
        );
        Ok(count)
    }

    /// Remove and return up to `max_items` from the front of the queue.
    pub async fn dequeue(&self, max_items: usize) -> Result<Vec<T>> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let current_size = self.kv.get_u64(&self.size_key(), 0).await?;
        if current_size == 0 {
            return Ok(Vec::new());
        }

        let next_id = self.kv.get_u64(&self.next_id_key(), 0).await?;
        let start_id = next_id.saturating_sub(current_size);
        let take = (max_items as u64).min(current_size);

        let mut results = Vec::with_capacity(take as usize);
        let read_result: Result<()> = async {
            for i in 0..take {
                let key = self.item_key(start_id + i);
                match self.kv.get(&key).await? {
                    Some(data) => {
                        let item = self.serializer.deserialize(&data)?;
                        results.push(item);
                        self.kv.delete(&key).await?;
                    }
                    None => {
                        warn!(
                            namespace = %self.namespace,
                            item_id = start_id + i,
                            "QUEUE_ITEM_MISSING_DURING_DEQUEUE"
                        );
                    }
                }
            }
            self.kv
                .put_u64(&self.size_key(), current_size - results.len() as u64)
                .await?;
            Ok(())
        }
        .await;

        if let Err(err) = read_result {
            // Items may be gone while the counter still reflects them; force
            // a recovery scan on next access.
            warn!(namespace = %self.namespace, error = %err, "QUEUE_DEQUEUE_FAILED_MARKING_RECOVERY");
            state.initialized = false;
            return Err(err);
        }

        debug!(
            namespace = %self.namespace,
            count = results.len(),
            new_size = current_size - results.len() as u64,
            "QUEUE_ITEMS_DEQUEUED"
        );
        Ok(results)
    }

    pub async fn size(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;
        self.kv.get_u64(&self.size_key(), 0).await
    }

    /// Read up to `max_items` from the front without removing them.
    pub async fn peek(&self, max_items: usize) -> Result<Vec<T>> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let current_size = self.kv.get_u64(&self.size_key(), 0).await?;
        if current_size == 0 {
            return Ok(Vec::new());
        }

        let next_id = self.kv.get_u64(&self.next_id_key(), 0).await?;
        let start_id = next_id.saturating_sub(current_size);
        let take = (max_items as u64).min(current_size);

        let mut results = Vec::with_capacity(take as usize);
        for i in 0..take {
            if let Some(data) = self.kv.get(&self.item_key(start_id + i)).await? {
                results.push(self.serializer.deserialize(&data)?);
            }
        }
        Ok(results)
    }

    /// Remove all items. Returns the number cleared.
    pub async fn clear(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;

        let current_size = self.kv.get_u64(&self.size_key(), 0).await?;
        if current_size == 0 {
            return Ok(0);
        }

        let next_id = self.kv.get_u64(&self.next_id_key(), 0).await?;
        let start_id = next_id.saturating_sub(current_size);
        for id in start_id..next_id {
            self.kv.delete(&self.item_key(id)).await?;
        }

        self.kv.put_u64(&self.size_key(), 0).await?;
        self.kv.put_u64(&self.next_id_key(), 0).await?;
        Ok(current_size)
    }

    /// The key-value store handles its own cleanup.
    pub async fn close(&self) -> Result<()> {
        Ok(())
    }
}
