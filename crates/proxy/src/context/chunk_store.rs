//! Content-addressed, partially-persisted store of condensed message
//! chunks, keyed by a hash of their contents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::messages::unified::UnifiedMessage;
use crate::token_counter::Tokenizer;

const RECORD_CAPACITY: u64 = 100;

/// Lifecycle of a chunk's condensed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ChunkState {
    Unprocessed,
    Condensing,
    Condensed,
    Modified,
    Expired,
}

/// A contiguous slice of a conversation considered as one condensation unit.
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    pub chunk_id: String,
    pub messages: Vec<UnifiedMessage>,
    pub is_vision: bool,
}

/// On-disk/in-memory bookkeeping for a chunk's condensation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkRecord {
    state: ChunkState,
    timestamp: u64,
    strategy: Option<String>,
    tokens_saved: u32,
    content_hash: String,
}

/// Persisted condensed payload, stored separately from the bookkeeping
/// record so readers of state never pay for loading the content.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkContent {
    condensed_content: String,
    condensed_at: u64,
}

/// Splits a message list into chunks, tracks their condensation state, and
/// persists condensed content to `cache_dir`.
///
/// Bounded in-process maps evict least-recently-accessed entries; on-disk
/// entries age out via a background cleaner (see [`ChunkStore::spawn_cleaner`]).
pub(crate) struct ChunkStore {
    cache_dir: std::path::PathBuf,
    chunk_size_messages: usize,
    chunk_max_tokens: u32,
    chunk_overlap_messages: usize,
    chunk_cache_ttl: Duration,
    chunk_age_threshold: Duration,

    chunks: Cache<String, Arc<Chunk>>,
    records: Cache<String, ChunkRecord>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ChunkStore {
    pub(crate) fn new(config: &config::CondensationConfig, cache_dir: &str) -> Self {
        Self {
            cache_dir: std::path::PathBuf::from(cache_dir),
            chunk_size_messages: config.chunk_size_messages,
            chunk_max_tokens: config.chunk_max_tokens,
            chunk_overlap_messages: config.chunk_overlap_messages,
            chunk_cache_ttl: config.chunk_cache_ttl,
            chunk_age_threshold: config.chunk_age_threshold,
            chunks: Cache::builder().max_capacity(RECORD_CAPACITY).build(),
            records: Cache::builder().max_capacity(RECORD_CAPACITY).build(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Splits `messages` into overlapping chunks per the configured size
    /// and token budgets, computing each chunk's content-addressed id.
    pub(crate) fn split(&self, tokenizer: &Tokenizer, family: crate::family::EndpointFamily, messages: &[UnifiedMessage], is_vision: bool) -> Vec<Arc<Chunk>> {
        let mut chunks = Vec::new();
        let mut current: Vec<UnifiedMessage> = Vec::new();
        let mut current_tokens: u32 = 0;

        for message in messages {
            let message_tokens = tokenizer.count_messages(family, std::slice::from_ref(message));

            let would_overflow = !current.is_empty() && current_tokens + message_tokens > self.chunk_max_tokens;
            let is_full = current.len() >= self.chunk_size_messages;

            if would_overflow || is_full {
                chunks.push(self.finalize_chunk(std::mem::take(&mut current), is_vision));
                current_tokens = 0;

                let overlap_start = chunks
                    .last()
                    .map(|c: &Arc<Chunk>| c.messages.len().saturating_sub(self.chunk_overlap_messages))
                    .unwrap_or(0);
                if let Some(previous) = chunks.last() {
                    for overlapped in &previous.messages[overlap_start..] {
                        current_tokens += tokenizer.count_messages(family, std::slice::from_ref(overlapped));
                        current.push(overlapped.clone());
                    }
                }
            }

            current_tokens += message_tokens;
            current.push(message.clone());
        }

        if !current.is_empty() {
            chunks.push(self.finalize_chunk(current, is_vision));
        }

        for chunk in &chunks {
            self.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        }

        chunks
    }

    fn finalize_chunk(&self, messages: Vec<UnifiedMessage>, is_vision: bool) -> Arc<Chunk> {
        let content_hash = content_hash(&messages);
        let chunk_id = format!("chunk_{}_{}", &content_hash[..16], is_vision);

        Arc::new(Chunk { chunk_id, messages, is_vision })
    }

    /// Current known state, defaulting to `Unprocessed` for a chunk the
    /// store has never seen, or `Expired` if stale past the cache TTL.
    pub(crate) fn state(&self, chunk_id: &str) -> ChunkState {
        match self.records.get(chunk_id) {
            Some(record) => {
                if record.state == ChunkState::Condensed && self.is_stale(&record) {
                    ChunkState::Expired
                } else {
                    record.state
                }
            }
            None => ChunkState::Unprocessed,
        }
    }

    fn is_stale(&self, record: &ChunkRecord) -> bool {
        let age = now_epoch().saturating_sub(record.timestamp);
        age > self.chunk_age_threshold.as_secs()
    }

    /// Previously condensed content for a chunk, if any is cached and not
    /// past the chunk cache TTL.
    pub(crate) async fn condensed_content(&self, chunk_id: &str) -> Option<String> {
        let record = self.records.get(chunk_id)?;
        if record.state != ChunkState::Condensed {
            return None;
        }
        if now_epoch().saturating_sub(record.timestamp) > self.chunk_cache_ttl.as_secs() {
            return None;
        }

        self.load_content(chunk_id).await.map(|content| content.condensed_content)
    }

    /// Acquires the per-chunk single-flight lock and runs `condense`,
    /// recording success or failure in the state machine.
    pub(crate) async fn condense_with<F, Fut>(&self, chunk_id: &str, strategy: &str, condense: F) -> anyhow::Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<(String, u32)>>,
    {
        let lock = self.chunk_lock(chunk_id);
        let _guard = lock.lock().await;

        self.records.insert(
            chunk_id.to_string(),
            ChunkRecord {
                state: ChunkState::Condensing,
                timestamp: now_epoch(),
                strategy: Some(strategy.to_string()),
                tokens_saved: 0,
                content_hash: chunk_id.to_string(),
            },
        );

        match condense().await {
            Ok((condensed_content, tokens_saved)) => {
                self.records.insert(
                    chunk_id.to_string(),
                    ChunkRecord {
                        state: ChunkState::Condensed,
                        timestamp: now_epoch(),
                        strategy: Some(strategy.to_string()),
                        tokens_saved,
                        content_hash: chunk_id.to_string(),
                    },
                );
                self.persist(chunk_id, &condensed_content).await;
                Ok(condensed_content)
            }
            Err(error) => {
                self.records.insert(
                    chunk_id.to_string(),
                    ChunkRecord {
                        state: ChunkState::Unprocessed,
                        timestamp: now_epoch(),
                        strategy: None,
                        tokens_saved: 0,
                        content_hash: chunk_id.to_string(),
                    },
                );
                Err(error)
            }
        }
    }

    fn chunk_lock(&self, chunk_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks.entry(chunk_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    async fn persist(&self, chunk_id: &str, condensed_content: &str) {
        if let Err(error) = tokio::fs::create_dir_all(&self.cache_dir).await {
            log::warn!("chunk store: failed to create cache dir: {error}");
            return;
        }

        let record = self.records.get(chunk_id);
        let content = ChunkContent { condensed_content: condensed_content.to_string(), condensed_at: now_epoch() };

        if let Some(record) = record {
            if let Ok(json) = serde_json::to_vec_pretty(&record) {
                let path = self.state_path(chunk_id);
                if let Err(error) = tokio::fs::write(&path, json).await {
                    log::warn!("chunk store: failed to persist state for {chunk_id}: {error}");
                }
            }
        }

        if let Ok(json) = serde_json::to_vec_pretty(&content) {
            let path = self.content_path(chunk_id);
            if let Err(error) = tokio::fs::write(&path, json).await {
                log::warn!("chunk store: failed to persist content for {chunk_id}: {error}");
            }
        }
    }

    async fn load_content(&self, chunk_id: &str) -> Option<ChunkContent> {
        let path = self.content_path(chunk_id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn state_path(&self, chunk_id: &str) -> std::path::PathBuf {
        self.cache_dir.join(format!("{chunk_id}_state.json"))
    }

    fn content_path(&self, chunk_id: &str) -> std::path::PathBuf {
        self.cache_dir.join(format!("{chunk_id}_content.json"))
    }

    /// Spawns the background task that deletes on-disk entries older than
    /// `chunk_cache_ttl`. Runs at `max(chunk_age_threshold / 4, 60s)`.
    pub(crate) fn spawn_cleaner(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = (self.chunk_age_threshold / 4).max(Duration::from_secs(60));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup_once().await;
            }
        })
    }

    async fn cleanup_once(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.cache_dir).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !name.ends_with("_state.json") {
                continue;
            }

            let Ok(bytes) = tokio::fs::read(&path).await else { continue };
            let Ok(record) = serde_json::from_slice::<ChunkRecord>(&bytes) else { continue };

            if now_epoch().saturating_sub(record.timestamp) > self.chunk_cache_ttl.as_secs() {
                let chunk_id = name.trim_end_matches("_state.json");
                let _ = tokio::fs::remove_file(&path).await;
                let _ = tokio::fs::remove_file(self.content_path(chunk_id)).await;
            }
        }
    }
}

fn content_hash(messages: &[UnifiedMessage]) -> String {
    let mut hasher = Sha256::new();

    for message in messages {
        hasher.update(role_tag(message).as_bytes());
        hasher.update([0]);
        if let Ok(json) = serde_json::to_vec(&message.content) {
            hasher.update(json);
        }
        hasher.update([0]);
    }

    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, byte| {
        let _ = write!(acc, "{byte:02x}");
        acc
    })
}

fn role_tag(message: &UnifiedMessage) -> &'static str {
    use crate::messages::unified::UnifiedRole;
    match message.role {
        UnifiedRole::System => "system",
        UnifiedRole::User => "user",
        UnifiedRole::Assistant => "assistant",
        UnifiedRole::Tool => "tool",
    }
}

fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedContentContainer, UnifiedRole};

    fn message(role: UnifiedRole, text: &str) -> UnifiedMessage {
        UnifiedMessage { role, content: UnifiedContentContainer::Text(text.to_string()), tool_calls: None, tool_call_id: None }
    }

    fn config() -> config::CondensationConfig {
        config::CondensationConfig {
            chunk_size_messages: 2,
            chunk_max_tokens: 10_000,
            chunk_overlap_messages: 1,
            ..config::CondensationConfig::default()
        }
    }

    #[test]
    fn split_respects_chunk_size_with_overlap() {
        let tokenizer = Tokenizer::new();
        let store = ChunkStore::new(&config(), "/tmp/proxy-chunk-test");
        let messages = vec![
            message(UnifiedRole::User, "one"),
            message(UnifiedRole::Assistant, "two"),
            message(UnifiedRole::User, "three"),
            message(UnifiedRole::Assistant, "four"),
        ];

        let chunks = store.split(&tokenizer, crate::family::EndpointFamily::Anthropic, &messages, false);

        // Size 2, overlap 1 over 4 messages slides forward by 1 message per chunk.
        assert_eq!(chunks.len(), 3);
        // The overlap message carried into chunk 2 is the last message of chunk 1.
        let overlap_text = match (&chunks[0].messages.last().unwrap().content, &chunks[1].messages.first().unwrap().content) {
            (UnifiedContentContainer::Text(a), UnifiedContentContainer::Text(b)) => a == b,
            _ => false,
        };
        assert!(overlap_text);
    }

    #[test]
    fn identical_message_lists_produce_identical_chunk_ids() {
        let tokenizer = Tokenizer::new();
        let store = ChunkStore::new(&config(), "/tmp/proxy-chunk-test");
        let messages = vec![message(UnifiedRole::User, "hello")];

        let a = store.split(&tokenizer, crate::family::EndpointFamily::Anthropic, &messages, false);
        let b = store.split(&tokenizer, crate::family::EndpointFamily::Anthropic, &messages, false);

        assert_eq!(a[0].chunk_id, b[0].chunk_id);
    }

    #[test]
    fn unseen_chunk_state_is_unprocessed() {
        let store = ChunkStore::new(&config(), "/tmp/proxy-chunk-test");
        assert_eq!(store.state("chunk_doesnotexist_false"), ChunkState::Unprocessed);
    }
}
