pub mod collection;
pub mod domain;
pub mod library;
pub mod ports;
pub mod rate_limiter;
pub mod store;

#[cfg(test)]
mod testing;

pub use collection::{Collection, CollectionSnapshot};
pub use domain::{
    ActionType, AppSetting, BackupDocument, Character, GeneratedStory, HistoryItem,
    HistoryRetention, ImportSummary, RestoreSummary, SavedStory, StoryLayout, StoryPart,
    StoryPrompt,
};
pub use library::{LibraryOptions, SaveOutcome, StoryLibrary};
pub use ports::{
    Clock, DocumentStore, GenerationErrorKind, KeyValueCache, PortError, PortResult,
    StoryGenerator, SystemClock,
};
pub use rate_limiter::{DailyLimits, RateLimiter, UsageReservation, UsageStatus};
pub use store::StoreName;
