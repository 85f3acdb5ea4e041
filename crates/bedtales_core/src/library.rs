//! crates/bedtales_core/src/library.rs
//!
//! The application orchestrator. Owns one `Collection` per entity, the rate limiter
//! and the story generator, and applies the cross-collection rules: natural-key dedup,
//! history upserts and retention, promotion from history to the library, bulk import
//! and backup/restore.
//!
//! The store enforces nothing across collections; every consistency rule between
//! stories, history and characters lives here.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collection::{Collection, CollectionSnapshot};
use crate::domain::{
    ActionType, AppSetting, AspectRatio, BackupDocument, Character, GeneratedStory,
    HistoryItem, HistoryRetention, ImportSummary, NaturalKey, RestoreSummary, SavedStory,
    StoryAudio, StoryLayout, StoryPart, StoryPrompt,
};
use crate::ports::{
    Clock, DocumentStore, GenerationErrorKind, KeyValueCache, PortError, PortResult,
    StoryGenerator,
};
use crate::rate_limiter::{DailyLimits, RateLimiter, UsageStatus};
use crate::store::{self, Record};

pub const HISTORY_RETENTION_KEY: &str = "history-retention";
pub const STORY_LAYOUT_KEY: &str = "story-layout";

const INVALID_BACKUP: &str = "This does not appear to be a valid BedTales backup file.";

//=========================================================================================
// Options and Outcomes
//=========================================================================================

#[derive(Debug, Clone, Copy)]
pub struct LibraryOptions {
    pub limits: DailyLimits,
    /// Pause between sequential illustration requests, to stay under provider rate limits.
    pub illustration_delay: StdDuration,
}

impl Default for LibraryOptions {
    fn default() -> Self {
        Self {
            limits: DailyLimits::default(),
            illustration_delay: StdDuration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Saved(SavedStory),
    /// A story with the same title and plot was already in the library; nothing changed.
    AlreadySaved(SavedStory),
}

impl SaveOutcome {
    pub fn story(&self) -> &SavedStory {
        match self {
            SaveOutcome::Saved(s) | SaveOutcome::AlreadySaved(s) => s,
        }
    }
}

/// The shape accepted by bulk import: a saved story whose `id` and `createdAt` may be
/// missing.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportedStory {
    id: Option<String>,
    #[serde(flatten)]
    story: GeneratedStory,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_favorite: bool,
}

//=========================================================================================
// Helpers
//=========================================================================================

fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn key_of(story: &GeneratedStory) -> (String, String) {
    let NaturalKey { title, plot } = story.natural_key();
    (title.to_string(), plot.to_string())
}

fn validate_prompt(prompt: &StoryPrompt) -> PortResult<()> {
    let fields = [&prompt.character, &prompt.setting, &prompt.plot, &prompt.concept];
    if fields.iter().any(|f| f.trim().is_empty()) {
        return Err(PortError::ValidationFailed(
            "Please fill in every part of the story idea before generating.".to_string(),
        ));
    }
    Ok(())
}

/// The name a saved story's character is filed under: the word after "named" when the
/// description has one, otherwise its first three words.
pub fn derive_character_name(description: &str) -> String {
    static NAMED: OnceLock<Regex> = OnceLock::new();
    let named = NAMED.get_or_init(|| {
        Regex::new(r"(?i)named\s+([a-z]\w+)").expect("character name pattern is valid")
    });
    match named.captures(description).and_then(|c| c.get(1)) {
        Some(name) => name.as_str().to_string(),
        None => description
            .split_whitespace()
            .take(3)
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// `bedtales_backup_<YYYY-MM-DD>.json`
pub fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("bedtales_backup_{}.json", at.format("%Y-%m-%d"))
}

fn parse_records<T: Record>(values: &[serde_json::Value], invalid: &mut usize) -> Vec<T> {
    let mut records = Vec::with_capacity(values.len());
    for value in values {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("Rejecting malformed {} record from backup: {}", T::STORE, e);
                *invalid += 1;
            }
        }
    }
    records
}

//=========================================================================================
// StoryLibrary
//=========================================================================================

pub struct StoryLibrary {
    store: Arc<dyn DocumentStore>,
    generator: Arc<dyn StoryGenerator>,
    clock: Arc<dyn Clock>,
    stories: Collection<SavedStory>,
    history: Collection<HistoryItem>,
    characters: Collection<Character>,
    settings: Collection<AppSetting>,
    limiter: RateLimiter,
    illustration_delay: StdDuration,
    // Held from a natural-key lookup through the write that depends on it.
    story_writes: Mutex<()>,
    history_writes: Mutex<()>,
    character_writes: Mutex<()>,
}

impl StoryLibrary {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn KeyValueCache>,
        generator: Arc<dyn StoryGenerator>,
        clock: Arc<dyn Clock>,
        options: LibraryOptions,
    ) -> Self {
        Self {
            stories: Collection::new(store.clone()),
            history: Collection::new(store.clone()),
            characters: Collection::new(store.clone()),
            settings: Collection::new(store.clone()),
            limiter: RateLimiter::new(store.clone(), cache, clock.clone(), options.limits),
            store,
            generator,
            clock,
            illustration_delay: options.illustration_delay,
            story_writes: Mutex::new(()),
            history_writes: Mutex::new(()),
            character_writes: Mutex::new(()),
        }
    }

    /// Loads every collection, reconciles usage and runs the first retention sweep.
    pub async fn init(&self) -> PortResult<()> {
        futures::try_join!(
            self.stories.load(),
            self.history.load(),
            self.characters.load(),
            self.settings.load(),
        )?;
        self.limiter.synchronize().await;
        let swept = self.sweep_history().await?;
        info!(
            "Library ready: {} stories, {} history items, {} characters ({} swept)",
            self.stories.data().len(),
            self.history.data().len(),
            self.characters.data().len(),
            swept
        );
        Ok(())
    }

    fn ensure_loaded<T: Record>(collection: &Collection<T>) -> PortResult<()> {
        if collection.is_loading() {
            return Err(PortError::StorageUnavailable(format!(
                "{} is still loading",
                T::STORE
            )));
        }
        Ok(())
    }

    //=====================================================================================
    // Views
    //=====================================================================================

    /// Saved stories, newest first.
    pub fn stories(&self) -> CollectionSnapshot<SavedStory> {
        let mut snapshot = self.stories.snapshot();
        snapshot.data.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshot
    }

    /// History, most recently read first.
    pub fn history(&self) -> CollectionSnapshot<HistoryItem> {
        let mut snapshot = self.history.snapshot();
        snapshot.data.sort_by(|a, b| b.read_at.cmp(&a.read_at));
        snapshot
    }

    pub fn characters(&self) -> CollectionSnapshot<Character> {
        let mut snapshot = self.characters.snapshot();
        snapshot.data.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshot
    }

    pub fn usage(&self) -> Vec<UsageStatus> {
        self.limiter.status()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn get_story(&self, id: &str) -> PortResult<SavedStory> {
        self.stories
            .get(id)
            .ok_or_else(|| PortError::NotFound(format!("Story {}", id)))
    }

    pub fn is_saved(&self, story: &GeneratedStory) -> bool {
        let key = story.natural_key();
        self.stories.find(|s| s.story.natural_key() == key).is_some()
    }

    //=====================================================================================
    // Generation
    //=====================================================================================

    pub async fn generate_ideas(&self, category: Option<&str>) -> PortResult<StoryPrompt> {
        self.generator.generate_ideas(category).await
    }

    pub async fn prompt_from_voice(&self, audio: &[u8]) -> PortResult<StoryPrompt> {
        if audio.is_empty() {
            return Err(PortError::ValidationFailed(
                "No audio was recorded. Please try speaking again.".to_string(),
            ));
        }
        self.generator.transcribe_voice_to_prompt(audio).await
    }

    /// Generates a story and its illustrations.
    ///
    /// One use of the daily quota is reserved before any generator call and recorded
    /// once the story text exists, even if an illustration fails afterwards. A failure
    /// before that hands the use back.
    pub async fn create_story(
        &self,
        prompt: StoryPrompt,
        layout: Option<StoryLayout>,
        reference_character_id: Option<&str>,
    ) -> PortResult<GeneratedStory> {
        validate_prompt(&prompt)?;
        let reservation = self.limiter.try_reserve(ActionType::CreateStory)?;

        let layout = layout.unwrap_or_else(|| self.story_layout());
        let aspect_ratio = layout.aspect_ratio();
        let reference_image = reference_character_id
            .and_then(|id| self.characters.get(id))
            .and_then(|c| c.image_url);

        let title = self.generator.generate_title(&prompt).await?;
        let mut parts = self
            .generator
            .generate_story_parts(&prompt, aspect_ratio, reference_image.as_deref())
            .await?;
        if parts.is_empty() {
            return Err(PortError::generation(
                GenerationErrorKind::MalformedResponse,
                "story has no parts",
            ));
        }
        drop(reservation.commit());

        self.illustrate(&mut parts, aspect_ratio).await?;

        info!("Generated story '{}' with {} parts", title, parts.len());
        Ok(GeneratedStory {
            title,
            parts,
            prompt,
            layout,
        })
    }

    /// Illustrates every part that has no image yet, one request at a time with a pause
    /// between requests.
    async fn illustrate(&self, parts: &mut [StoryPart], aspect_ratio: AspectRatio) -> PortResult<()> {
        let mut requested = false;
        for part in parts.iter_mut().filter(|p| p.image_url.is_none()) {
            if requested {
                tokio::time::sleep(self.illustration_delay).await;
            }
            requested = true;
            let image = self
                .generator
                .generate_illustration(&part.image_prompt, aspect_ratio)
                .await?;
            part.image_url = Some(image);
        }
        Ok(())
    }

    /// Generates a portrait for a new character and stores it.
    pub async fn create_character(&self, name: &str, description: &str) -> PortResult<Character> {
        if name.trim().is_empty() || description.trim().is_empty() {
            return Err(PortError::ValidationFailed(
                "Please give your character a name and a description.".to_string(),
            ));
        }
        let reservation = self.limiter.try_reserve(ActionType::CreateCharacter)?;
        let portrait = self.generator.generate_character_portrait(description).await?;
        drop(reservation.commit());
        self.add_character(name, description, Some(portrait)).await
    }

    //=====================================================================================
    // Characters
    //=====================================================================================

    pub async fn add_character(
        &self,
        name: &str,
        description: &str,
        image_url: Option<String>,
    ) -> PortResult<Character> {
        let character = Character {
            id: new_id("char"),
            name: name.trim().to_string(),
            description: description.trim().to_string(),
            image_url,
            created_at: self.clock.now(),
        };
        self.characters.add(character.clone()).await?;
        Ok(character)
    }

    pub async fn delete_character(&self, id: &str) -> PortResult<()> {
        self.characters.delete(id).await
    }

    pub async fn clear_characters(&self) -> PortResult<()> {
        self.characters.clear().await
    }

    //=====================================================================================
    // Saved Stories
    //=====================================================================================

    /// Saves a generated or history story to the library.
    ///
    /// A story already saved under the same title and plot is returned unchanged. Once
    /// the story is stored, a matching history item is removed, and the prompt's
    /// character is filed as a new character when none matches and the story has an
    /// illustration. Failures after the story is stored are logged, not returned.
    pub async fn save_story(&self, source: &GeneratedStory) -> PortResult<SaveOutcome> {
        let key = source.natural_key();
        let saved = {
            let _writes = self.story_writes.lock().await;
            Self::ensure_loaded(&self.stories)?;
            if let Some(existing) = self.stories.find(|s| s.story.natural_key() == key) {
                return Ok(SaveOutcome::AlreadySaved(existing));
            }
            let saved = SavedStory {
                id: new_id("story"),
                story: source.clone(),
                created_at: self.clock.now(),
                is_favorite: false,
                audio: None,
            };
            self.stories.add(saved.clone()).await?;
            saved
        };
        info!("Saved story '{}' as {}", saved.story.title, saved.id);

        if let Err(e) = self.remove_from_history(key).await {
            warn!("Story saved but its history item could not be removed: {}", e);
        }
        if let Err(e) = self.file_character_from(source).await {
            warn!("Story saved but its character could not be added: {}", e);
        }
        Ok(SaveOutcome::Saved(saved))
    }

    async fn remove_from_history(&self, key: NaturalKey<'_>) -> PortResult<()> {
        let _writes = self.history_writes.lock().await;
        if let Some(read) = self.history.find(|h| h.story.natural_key() == key) {
            self.history.delete(&read.id).await?;
        }
        Ok(())
    }

    async fn file_character_from(&self, story: &GeneratedStory) -> PortResult<()> {
        let Some(image) = story.cover_image() else {
            return Ok(());
        };
        let _writes = self.character_writes.lock().await;
        let description = story.prompt.character.trim();
        let name = derive_character_name(description);
        let lowered = name.to_lowercase();
        let exists = self
            .characters
            .find(|c| c.name.to_lowercase() == lowered || c.description == description)
            .is_some();
        if !exists {
            self.add_character(&name, description, Some(image.to_string()))
                .await?;
        }
        Ok(())
    }

    fn ensure_not_saved(&self, story: &GeneratedStory) -> PortResult<()> {
        Self::ensure_loaded(&self.stories)?;
        if self.is_saved(story) {
            return Err(PortError::ValidationFailed(
                "This story is already in your library!".to_string(),
            ));
        }
        Ok(())
    }

    /// Imports one complete story. Duplicates are rejected.
    pub async fn import_story(&self, story: GeneratedStory) -> PortResult<SavedStory> {
        let _writes = self.story_writes.lock().await;
        self.ensure_not_saved(&story)?;
        let saved = SavedStory {
            id: new_id("story"),
            story,
            created_at: self.clock.now(),
            is_favorite: false,
            audio: None,
        };
        self.stories.add(saved.clone()).await?;
        Ok(saved)
    }

    /// Imports a story received as a share code. Share codes carry image prompts but no
    /// pictures, so the parts are illustrated again before the story is stored.
    /// Duplicates are rejected before illustrating, and again when storing.
    pub async fn import_shared_story(&self, mut story: GeneratedStory) -> PortResult<SavedStory> {
        self.ensure_not_saved(&story)?;
        let aspect_ratio = story.layout.aspect_ratio();
        self.illustrate(&mut story.parts, aspect_ratio).await?;
        self.import_story(story).await
    }

    /// Imports an arbitrary array of story-shaped values.
    ///
    /// Malformed entries are counted as invalid, entries whose title and plot match a
    /// saved story (or an earlier entry) as duplicates. Only new stories are written,
    /// in one batch; existing stories are never overwritten.
    pub async fn import_stories(&self, values: Vec<serde_json::Value>) -> PortResult<ImportSummary> {
        let _writes = self.story_writes.lock().await;
        Self::ensure_loaded(&self.stories)?;
        let existing = self.stories.data();
        let mut seen_keys: HashSet<(String, String)> =
            existing.iter().map(|s| key_of(&s.story)).collect();
        let mut used_ids: HashSet<String> = existing.iter().map(|s| s.id.clone()).collect();

        let mut summary = ImportSummary::default();
        let mut fresh = Vec::new();
        for value in values {
            let imported = match serde_json::from_value::<ImportedStory>(value) {
                Ok(imported) if !imported.story.title.trim().is_empty() => imported,
                Ok(_) => {
                    summary.invalid += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Rejecting malformed story from import: {}", e);
                    summary.invalid += 1;
                    continue;
                }
            };
            if !seen_keys.insert(key_of(&imported.story)) {
                summary.duplicates += 1;
                continue;
            }
            let id = match imported.id {
                Some(id) if !id.is_empty() && !used_ids.contains(&id) => id,
                _ => new_id("story"),
            };
            used_ids.insert(id.clone());
            fresh.push(SavedStory {
                id,
                story: imported.story,
                created_at: imported.created_at.unwrap_or_else(|| self.clock.now()),
                is_favorite: imported.is_favorite,
                audio: None,
            });
        }

        if !fresh.is_empty() {
            self.stories.bulk_add(&fresh).await?;
        }
        summary.imported = fresh.len();
        info!(
            "Imported {} stories ({} duplicates, {} invalid)",
            summary.imported, summary.duplicates, summary.invalid
        );
        Ok(summary)
    }

    pub async fn toggle_favorite(&self, id: &str) -> PortResult<SavedStory> {
        let _writes = self.story_writes.lock().await;
        let mut story = self.get_story(id)?;
        story.is_favorite = !story.is_favorite;
        self.stories.update(story.clone()).await?;
        Ok(story)
    }

    /// Narration audio for a saved story, synthesized once per voice and cached on the
    /// story record.
    pub async fn narrate_story(&self, id: &str, voice_id: &str) -> PortResult<Vec<u8>> {
        let mut story = self.get_story(id)?;
        if let Some(audio) = story.audio.as_ref().filter(|a| a.voice_id == voice_id) {
            return Ok(audio.data.clone());
        }
        let data = self
            .generator
            .synthesize_speech(&story.story.narration_text(), voice_id)
            .await?;
        story.audio = Some(StoryAudio {
            voice_id: voice_id.to_string(),
            data: data.clone(),
        });
        self.stories.update(story).await?;
        Ok(data)
    }

    pub async fn delete_story(&self, id: &str) -> PortResult<()> {
        self.stories.delete(id).await
    }

    pub async fn delete_stories(&self, ids: &[String]) -> PortResult<()> {
        self.stories.delete_many(ids).await
    }

    pub async fn clear_stories(&self) -> PortResult<()> {
        self.stories.clear().await
    }

    //=====================================================================================
    // History
    //=====================================================================================

    /// Records that `story` was read: refreshes `readAt` on the matching history item,
    /// or creates one.
    pub async fn read_story(&self, story: &GeneratedStory) -> PortResult<HistoryItem> {
        let item = {
            let _writes = self.history_writes.lock().await;
            Self::ensure_loaded(&self.history)?;
            let now = self.clock.now();
            let key = story.natural_key();
            match self.history.find(|h| h.story.natural_key() == key) {
                Some(mut existing) => {
                    existing.read_at = now;
                    self.history.update(existing.clone()).await?;
                    existing
                }
                None => {
                    let item = HistoryItem {
                        id: new_id("history"),
                        story: story.clone(),
                        read_at: now,
                    };
                    self.history.add(item.clone()).await?;
                    item
                }
            }
        };
        if let Err(e) = self.sweep_history().await {
            warn!("History sweep after read failed: {}", e);
        }
        Ok(item)
    }

    pub async fn delete_history_item(&self, id: &str) -> PortResult<()> {
        self.history.delete(id).await
    }

    pub async fn clear_history(&self) -> PortResult<()> {
        self.history.clear().await
    }

    /// Deletes, in one transaction, every history item at least as old as the
    /// configured retention period. Returns how many were removed.
    pub async fn sweep_history(&self) -> PortResult<usize> {
        let Some(max_age) = self.history_retention().max_age() else {
            return Ok(0);
        };
        let _writes = self.history_writes.lock().await;
        if self.history.is_loading() {
            return Ok(0);
        }
        let now = self.clock.now();
        let expired: Vec<String> = self
            .history
            .data()
            .into_iter()
            .filter(|item| now - item.read_at >= max_age)
            .map(|item| item.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        self.history.delete_many(&expired).await?;
        info!("Swept {} expired history items", expired.len());
        Ok(expired.len())
    }

    //=====================================================================================
    // Settings
    //=====================================================================================

    pub fn settings(&self) -> BTreeMap<String, serde_json::Value> {
        self.settings
            .data()
            .into_iter()
            .map(|s| (s.id, s.value))
            .collect()
    }

    pub fn setting(&self, key: &str) -> Option<serde_json::Value> {
        self.settings.get(key).map(|s| s.value)
    }

    /// Stores a setting. Known keys are type-checked; changing the history retention
    /// sweeps immediately.
    pub async fn set_setting(&self, key: &str, value: serde_json::Value) -> PortResult<()> {
        match key {
            HISTORY_RETENTION_KEY => {
                serde_json::from_value::<HistoryRetention>(value.clone()).map_err(|_| {
                    PortError::ValidationFailed(format!("{} is not a valid history retention", value))
                })?;
            }
            STORY_LAYOUT_KEY => {
                serde_json::from_value::<StoryLayout>(value.clone()).map_err(|_| {
                    PortError::ValidationFailed(format!("{} is not a valid story layout", value))
                })?;
            }
            _ => {}
        }
        self.settings
            .add(AppSetting {
                id: key.to_string(),
                value,
            })
            .await?;
        if key == HISTORY_RETENTION_KEY {
            self.sweep_history().await?;
        }
        Ok(())
    }

    pub fn history_retention(&self) -> HistoryRetention {
        self.setting(HISTORY_RETENTION_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub async fn set_history_retention(&self, retention: HistoryRetention) -> PortResult<()> {
        let value = serde_json::to_value(retention)
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        self.set_setting(HISTORY_RETENTION_KEY, value).await
    }

    pub fn story_layout(&self) -> StoryLayout {
        self.setting(STORY_LAYOUT_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    //=====================================================================================
    // Backup and Restore
    //=====================================================================================

    /// Reads every collection fresh from the durable store, not from memory.
    pub async fn export_backup(&self) -> PortResult<BackupDocument> {
        let store = self.store.as_ref();
        let (stories, history, characters, settings) = futures::try_join!(
            store::load_all::<SavedStory>(store),
            store::load_all::<HistoryItem>(store),
            store::load_all::<Character>(store),
            store::load_all::<AppSetting>(store),
        )?;
        Ok(BackupDocument {
            stories,
            history,
            characters,
            settings,
        })
    }

    pub fn backup_file_name(&self) -> String {
        backup_file_name(self.clock.now())
    }

    /// Restores a backup document.
    ///
    /// `stories`, `history` and `characters` must be present as arrays. Records are
    /// upserted by id; a record whose title and plot match an existing record under a
    /// different id is skipped. Usage counters are never restored: they are
    /// recomputed once the data is in.
    pub async fn restore_backup(&self, document: serde_json::Value) -> PortResult<RestoreSummary> {
        let invalid_backup = || PortError::ValidationFailed(INVALID_BACKUP.to_string());
        let object = document.as_object().ok_or_else(invalid_backup)?;
        let array = |name: &str| -> PortResult<Vec<serde_json::Value>> {
            object
                .get(name)
                .and_then(|v| v.as_array())
                .cloned()
                .ok_or_else(invalid_backup)
        };
        let raw_stories = array("stories")?;
        let raw_history = array("history")?;
        let raw_characters = array("characters")?;
        let raw_settings = object
            .get("settings")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut summary = RestoreSummary::default();
        let stories: Vec<SavedStory> = parse_records(&raw_stories, &mut summary.invalid);
        let history: Vec<HistoryItem> = parse_records(&raw_history, &mut summary.invalid);
        let characters: Vec<Character> = parse_records(&raw_characters, &mut summary.invalid);
        let settings: Vec<AppSetting> = parse_records(&raw_settings, &mut summary.invalid);

        let story_writes = self.story_writes.lock().await;
        let history_writes = self.history_writes.lock().await;
        let stories = Self::without_conflicts(
            stories,
            &self.stories.data(),
            |s| (s.id.clone(), key_of(&s.story)),
            &mut summary.duplicates,
        );
        let history = Self::without_conflicts(
            history,
            &self.history.data(),
            |h| (h.id.clone(), key_of(&h.story)),
            &mut summary.duplicates,
        );

        if !stories.is_empty() {
            self.stories.bulk_add(&stories).await?;
        }
        if !history.is_empty() {
            self.history.bulk_add(&history).await?;
        }
        if !characters.is_empty() {
            self.characters.bulk_add(&characters).await?;
        }
        if !settings.is_empty() {
            self.settings.bulk_add(&settings).await?;
        }
        summary.stories = stories.len();
        summary.history = history.len();
        summary.characters = characters.len();
        summary.settings = settings.len();
        drop(history_writes);
        drop(story_writes);

        self.limiter.synchronize().await;
        if let Err(e) = self.sweep_history().await {
            warn!("History sweep after restore failed: {}", e);
        }
        info!("Restored backup: {:?}", summary);
        Ok(summary)
    }

    /// Drops incoming records whose natural key belongs to a different id, either in
    /// `existing` or earlier in `incoming`.
    fn without_conflicts<T>(
        incoming: Vec<T>,
        existing: &[T],
        identity: impl Fn(&T) -> (String, (String, String)),
        duplicates: &mut usize,
    ) -> Vec<T> {
        let mut owners: BTreeMap<(String, String), String> = existing
            .iter()
            .map(|r| {
                let (id, key) = identity(r);
                (key, id)
            })
            .collect();
        let mut kept = Vec::with_capacity(incoming.len());
        for record in incoming {
            let (id, key) = identity(&record);
            match owners.get(&key) {
                Some(owner) if *owner != id => *duplicates += 1,
                _ => {
                    owners.insert(key, id);
                    kept.push(record);
                }
            }
        }
        kept
    }
}
