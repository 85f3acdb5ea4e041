pub mod cache;
pub mod generator;
pub mod images;
pub mod sst;
pub mod store;
pub mod story_llm;
pub mod tts;

pub use cache::JsonFileCache;
pub use generator::OpenAiStoryGenerator;
pub use images::OpenAiIllustrator;
pub use sst::OpenAiSstAdapter;
pub use store::SqliteDocumentStore;
pub use story_llm::OpenAiStoryWriter;
pub use tts::OpenAiTtsAdapter;
