//! In-memory doubles for the ports, used by the core's unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{AspectRatio, StoryPart, StoryPrompt};
use crate::ports::{
    Clock, DocumentStore, GenerationErrorKind, KeyValueCache, PortError, PortResult, StoryGenerator,
};
use crate::store::StoreName;

//=========================================================================================
// Document Store
//=========================================================================================

#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<StoreName, BTreeMap<String, serde_json::Value>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_puts: AtomicBool,
    write_delay_ms: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fails inserts while deletes keep working.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Makes every write wait before it lands, to widen race windows.
    pub fn delay_writes(&self, millis: usize) {
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn count(&self, store: StoreName) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(&store)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn raw(&self, store: StoreName, id: &str) -> Option<serde_json::Value> {
        self.collections
            .lock()
            .unwrap()
            .get(&store)
            .and_then(|c| c.get(id).cloned())
    }

    async fn before_write(&self) -> PortResult<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(StdDuration::from_millis(delay as u64)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PortError::TransactionFailed("injected write failure".to_string()));
        }
        Ok(())
    }

    async fn before_put(&self) -> PortResult<()> {
        self.before_write().await?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(PortError::TransactionFailed("injected put failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_all(&self, store: StoreName) -> PortResult<Vec<serde_json::Value>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PortError::StorageUnavailable("injected read failure".to_string()));
        }
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(&store)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, store: StoreName, id: &str, value: serde_json::Value) -> PortResult<()> {
        self.before_put().await?;
        self.collections
            .lock()
            .unwrap()
            .entry(store)
            .or_default()
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn delete(&self, store: StoreName, id: &str) -> PortResult<()> {
        self.before_write().await?;
        if let Some(c) = self.collections.lock().unwrap().get_mut(&store) {
            c.remove(id);
        }
        Ok(())
    }

    async fn delete_many(&self, store: StoreName, ids: &[String]) -> PortResult<()> {
        self.before_write().await?;
        if let Some(c) = self.collections.lock().unwrap().get_mut(&store) {
            for id in ids {
                c.remove(id);
            }
        }
        Ok(())
    }

    async fn clear(&self, store: StoreName) -> PortResult<()> {
        self.before_write().await?;
        self.collections.lock().unwrap().remove(&store);
        Ok(())
    }

    async fn bulk_put(
        &self,
        store: StoreName,
        items: Vec<(String, serde_json::Value)>,
    ) -> PortResult<()> {
        self.before_put().await?;
        let mut collections = self.collections.lock().unwrap();
        let c = collections.entry(store).or_default();
        for (id, value) in items {
            c.insert(id, value);
        }
        Ok(())
    }
}

//=========================================================================================
// Cache and Clock
//=========================================================================================

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueCache for MemoryCache {
    fn get(&self, key: &str) -> PortResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PortResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(rfc3339: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc);
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

//=========================================================================================
// Story Generator
//=========================================================================================

/// Returns canned content and records how often it was called.
#[derive(Default)]
pub struct ScriptedGenerator {
    pub story_calls: AtomicUsize,
    pub illustration_calls: AtomicUsize,
    pub portrait_calls: AtomicUsize,
    pub speech_calls: AtomicUsize,
    fail_illustrations: AtomicBool,
    latency_ms: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_illustrations(&self) {
        self.fail_illustrations.store(true, Ordering::SeqCst);
    }

    /// Makes title, story and portrait calls take `millis` to answer.
    pub fn slow_down(&self, millis: usize) {
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    async fn think(&self) {
        let millis = self.latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(StdDuration::from_millis(millis as u64)).await;
        }
    }

    pub fn prompt() -> StoryPrompt {
        StoryPrompt {
            character: "A fox named Ren".to_string(),
            setting: "a library".to_string(),
            plot: "find a lost book".to_string(),
            concept: "curiosity".to_string(),
        }
    }
}

#[async_trait]
impl StoryGenerator for ScriptedGenerator {
    async fn generate_ideas(&self, _category: Option<&str>) -> PortResult<StoryPrompt> {
        Ok(Self::prompt())
    }

    async fn generate_title(&self, prompt: &StoryPrompt) -> PortResult<String> {
        self.think().await;
        Ok(format!("The Tale of {}", prompt.plot))
    }

    async fn generate_story_parts(
        &self,
        _prompt: &StoryPrompt,
        _aspect_ratio: AspectRatio,
        _reference_image: Option<&str>,
    ) -> PortResult<Vec<StoryPart>> {
        self.story_calls.fetch_add(1, Ordering::SeqCst);
        self.think().await;
        Ok((1..=3)
            .map(|i| StoryPart {
                paragraph: format!("Paragraph {}", i),
                image_prompt: format!("Scene {}", i),
                image_url: None,
            })
            .collect())
    }

    async fn generate_illustration(
        &self,
        image_prompt: &str,
        _aspect_ratio: AspectRatio,
    ) -> PortResult<String> {
        self.illustration_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_illustrations.load(Ordering::SeqCst) {
            return Err(PortError::generation(GenerationErrorKind::SafetyFiltered, "blocked"));
        }
        Ok(format!("data:image/png;base64,{}", image_prompt.replace(' ', "_")))
    }

    async fn generate_character_portrait(&self, _description: &str) -> PortResult<String> {
        self.portrait_calls.fetch_add(1, Ordering::SeqCst);
        self.think().await;
        Ok("data:image/png;base64,portrait".to_string())
    }

    async fn transcribe_voice_to_prompt(&self, _audio: &[u8]) -> PortResult<StoryPrompt> {
        Ok(Self::prompt())
    }

    async fn synthesize_speech(&self, text: &str, _voice_id: &str) -> PortResult<Vec<u8>> {
        self.speech_calls.fetch_add(1, Ordering::SeqCst);
        Ok(text.as_bytes().to_vec())
    }
}
