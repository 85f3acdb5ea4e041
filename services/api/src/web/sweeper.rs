//! services/api/src/web/sweeper.rs
//!
//! Background task that periodically removes history items older than the
//! configured retention period.

use std::sync::Arc;
use std::time::Duration;

use bedtales_core::library::StoryLibrary;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs `sweep_history` every `every` until `shutdown` is cancelled.
///
/// The first tick fires one full period after start; `StoryLibrary::init` has already
/// swept once by then.
pub fn spawn_history_sweeper(
    library: Arc<StoryLibrary>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("History sweeper started (every {:?})", every);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("History sweeper stopped.");
                    break;
                }
                _ = ticker.tick() => {
                    match library.sweep_history().await {
                        Ok(0) => debug!("History sweep found nothing to remove"),
                        Ok(removed) => info!("History sweep removed {} items", removed),
                        // A failed sweep is retried on the next tick.
                        Err(e) => warn!("History sweep failed: {}", e),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{JsonFileCache, SqliteDocumentStore};
    use async_trait::async_trait;
    use bedtales_core::domain::{AspectRatio, GeneratedStory, StoryLayout, StoryPart, StoryPrompt};
    use bedtales_core::library::LibraryOptions;
    use bedtales_core::ports::{
        Clock, GenerationErrorKind, PortError, PortResult, StoryGenerator,
    };
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    struct SteppedClock(Mutex<DateTime<Utc>>);

    impl SteppedClock {
        fn advance(&self, by: chrono::Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for SteppedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// The sweeper never generates anything.
    struct OfflineGenerator;

    fn offline<T>() -> PortResult<T> {
        Err(PortError::generation(GenerationErrorKind::Network, "offline"))
    }

    #[async_trait]
    impl StoryGenerator for OfflineGenerator {
        async fn generate_ideas(&self, _: Option<&str>) -> PortResult<StoryPrompt> {
            offline()
        }
        async fn generate_title(&self, _: &StoryPrompt) -> PortResult<String> {
            offline()
        }
        async fn generate_story_parts(
            &self,
            _: &StoryPrompt,
            _: AspectRatio,
            _: Option<&str>,
        ) -> PortResult<Vec<StoryPart>> {
            offline()
        }
        async fn generate_illustration(&self, _: &str, _: AspectRatio) -> PortResult<String> {
            offline()
        }
        async fn generate_character_portrait(&self, _: &str) -> PortResult<String> {
            offline()
        }
        async fn transcribe_voice_to_prompt(&self, _: &[u8]) -> PortResult<StoryPrompt> {
            offline()
        }
        async fn synthesize_speech(&self, _: &str, _: &str) -> PortResult<Vec<u8>> {
            offline()
        }
    }

    fn story() -> GeneratedStory {
        GeneratedStory {
            title: "The Sleepy Owl".to_string(),
            parts: vec![StoryPart {
                paragraph: "The owl yawned.".to_string(),
                image_prompt: "an owl on a branch".to_string(),
                image_url: None,
            }],
            prompt: StoryPrompt {
                character: "an owl".to_string(),
                setting: "a forest".to_string(),
                plot: "falls asleep".to_string(),
                concept: "rest".to_string(),
            },
            layout: StoryLayout::Classic,
        }
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_history_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteDocumentStore::new(format!(
            "sqlite://{}",
            dir.path().join("sweep.db").display()
        )));
        let cache = Arc::new(JsonFileCache::open(dir.path().join("cache.json")));
        let start = "2026-03-01T20:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let clock = Arc::new(SteppedClock(Mutex::new(start)));
        let library = Arc::new(StoryLibrary::new(
            store,
            cache,
            Arc::new(OfflineGenerator),
            clock.clone(),
            LibraryOptions::default(),
        ));
        library.init().await.unwrap();
        library.read_story(&story()).await.unwrap();
        assert_eq!(library.history().data.len(), 1);

        let shutdown = CancellationToken::new();
        let handle = spawn_history_sweeper(
            library.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(library.history().data.len(), 1);

        clock.advance(chrono::Duration::days(7));
        let mut swept = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if library.history().data.is_empty() {
                swept = true;
                break;
            }
        }
        assert!(swept, "expired history was never swept");

        shutdown.cancel();
        handle.await.unwrap();
    }
}
