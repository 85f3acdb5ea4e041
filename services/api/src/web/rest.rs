//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.
//!
//! Handlers are thin: each one forwards to `StoryLibrary` and turns a `PortError`
//! into a status code plus the user-facing message.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use bedtales_core::domain::{GeneratedStory, StoryLayout, StoryPrompt};
use bedtales_core::library::SaveOutcome;
use bedtales_core::ports::PortError;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::{OpenApi, ToSchema};

use crate::share;
use crate::web::state::AppState;

type ApiResult<T> = Result<T, (StatusCode, String)>;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        list_stories_handler,
        save_story_handler,
        delete_story_handler,
        delete_stories_handler,
        clear_stories_handler,
        toggle_favorite_handler,
        narrate_story_handler,
        share_story_handler,
        import_stories_handler,
        import_code_handler,
        list_history_handler,
        read_story_handler,
        delete_history_item_handler,
        clear_history_handler,
        list_characters_handler,
        create_character_handler,
        delete_character_handler,
        clear_characters_handler,
        get_settings_handler,
        put_setting_handler,
        usage_handler,
        generate_ideas_handler,
        generate_story_handler,
        voice_prompt_handler,
        export_backup_handler,
        restore_backup_handler,
    ),
    components(
        schemas(
            SaveStoryResponse,
            DeleteStoriesRequest,
            NarrationRequest,
            ShareCodeResponse,
            ImportCodeRequest,
            CreateCharacterRequest,
            IdeasRequest,
            GenerateStoryRequest,
        )
    ),
    tags(
        (name = "BedTales API", description = "Story library, history, characters and generation for the bedtime story app.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Error Mapping
//=========================================================================================

/// Maps a port error to a response. The body is always the user-facing message.
pub fn port_error(e: PortError) -> (StatusCode, String) {
    let status = match &e {
        PortError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        PortError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
        PortError::NotFound(_) => StatusCode::NOT_FOUND,
        PortError::Generation { .. } => StatusCode::BAD_GATEWAY,
        PortError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        PortError::TransactionFailed(_) | PortError::Unexpected(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    (status, e.user_message())
}

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveStoryResponse {
    #[schema(value_type = Object)]
    story: bedtales_core::domain::SavedStory,
    /// True when an equal story was already in the library and nothing was written.
    already_saved: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct DeleteStoriesRequest {
    ids: Vec<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NarrationRequest {
    voice_id: String,
}

#[derive(Serialize, ToSchema)]
pub struct ShareCodeResponse {
    code: String,
}

#[derive(Deserialize, ToSchema)]
pub struct ImportCodeRequest {
    /// A share code or a link containing one.
    code: String,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateCharacterRequest {
    name: String,
    description: String,
}

#[derive(Deserialize, ToSchema)]
pub struct IdeasRequest {
    category: Option<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateStoryRequest {
    #[schema(value_type = Object)]
    prompt: StoryPrompt,
    #[schema(value_type = Option<String>)]
    layout: Option<StoryLayout>,
    /// A saved character whose portrait guides the illustrations.
    character_id: Option<String>,
}

//=========================================================================================
// Saved Stories
//=========================================================================================

/// List saved stories, newest first.
#[utoipa::path(
    get,
    path = "/stories",
    responses((status = 200, description = "The library as `{data, loading, error}`"))
)]
pub async fn list_stories_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.library.stories())
}

/// Save a story to the library. Saving an already saved story changes nothing.
#[utoipa::path(
    post,
    path = "/stories",
    request_body(content = Object, description = "A generated story"),
    responses(
        (status = 201, description = "Story saved", body = SaveStoryResponse),
        (status = 200, description = "An equal story was already saved", body = SaveStoryResponse),
        (status = 503, description = "The library is not loaded yet")
    )
)]
pub async fn save_story_handler(
    State(app_state): State<Arc<AppState>>,
    Json(story): Json<GeneratedStory>,
) -> ApiResult<impl IntoResponse> {
    let outcome = app_state
        .library
        .save_story(&story)
        .await
        .map_err(port_error)?;
    let (status, already_saved) = match &outcome {
        SaveOutcome::Saved(_) => (StatusCode::CREATED, false),
        SaveOutcome::AlreadySaved(_) => (StatusCode::OK, true),
    };
    let response = SaveStoryResponse {
        story: outcome.story().clone(),
        already_saved,
    };
    Ok((status, Json(response)))
}

#[utoipa::path(
    delete,
    path = "/stories/{id}",
    params(("id" = String, Path, description = "Story id")),
    responses((status = 204, description = "Deleted, or never existed"))
)]
pub async fn delete_story_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app_state.library.delete_story(&id).await.map_err(port_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Delete several stories in one transaction.
#[utoipa::path(
    post,
    path = "/stories/delete",
    request_body = DeleteStoriesRequest,
    responses((status = 204, description = "Deleted"))
)]
pub async fn delete_stories_handler(
    State(app_state): State<Arc<AppState>>,
    Json(body): Json<DeleteStoriesRequest>,
) -> ApiResult<StatusCode> {
    app_state
        .library
        .delete_stories(&body.ids)
        .await
        .map_err(port_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/stories",
    responses((status = 204, description = "Every saved story was deleted"))
)]
pub async fn clear_stories_handler(State(app_state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    app_state.library.clear_stories().await.map_err(port_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/stories/{id}/favorite",
    params(("id" = String, Path, description = "Story id")),
    responses(
        (status = 200, description = "The story with its new favorite flag"),
        (status = 404, description = "No such story")
    )
)]
pub async fn toggle_favorite_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let story = app_state
        .library
        .toggle_favorite(&id)
        .await
        .map_err(port_error)?;
    Ok(Json(story))
}

/// Narrate a saved story. The audio is cached per voice on the story.
#[utoipa::path(
    post,
    path = "/stories/{id}/narration",
    params(("id" = String, Path, description = "Story id")),
    request_body = NarrationRequest,
    responses(
        (status = 200, description = "WAV audio", content_type = "audio/wav"),
        (status = 404, description = "No such story"),
        (status = 502, description = "Speech synthesis failed")
    )
)]
pub async fn narrate_story_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<NarrationRequest>,
) -> ApiResult<impl IntoResponse> {
    let audio = app_state
        .library
        .narrate_story(&id, &body.voice_id)
        .await
        .map_err(port_error)?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], audio))
}

#[utoipa::path(
    get,
    path = "/stories/{id}/share",
    params(("id" = String, Path, description = "Story id")),
    responses(
        (status = 200, description = "A share code for the story", body = ShareCodeResponse),
        (status = 404, description = "No such story")
    )
)]
pub async fn share_story_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ShareCodeResponse>> {
    let story = app_state.library.get_story(&id).map_err(port_error)?;
    let code = share::encode(&story).map_err(port_error)?;
    Ok(Json(ShareCodeResponse { code }))
}

/// Import an array of stories, e.g. the `stories` of another device's backup.
#[utoipa::path(
    post,
    path = "/stories/import",
    request_body(content = Vec<Object>, description = "Story-shaped JSON objects"),
    responses((status = 200, description = "Counts of imported, duplicate and invalid entries"))
)]
pub async fn import_stories_handler(
    State(app_state): State<Arc<AppState>>,
    Json(values): Json<Vec<serde_json::Value>>,
) -> ApiResult<impl IntoResponse> {
    let summary = app_state
        .library
        .import_stories(values)
        .await
        .map_err(port_error)?;
    Ok(Json(summary))
}

/// Import a story from a share code, illustrating it again.
#[utoipa::path(
    post,
    path = "/stories/import-code",
    request_body = ImportCodeRequest,
    responses(
        (status = 201, description = "The imported story"),
        (status = 400, description = "Invalid code or the story is already saved")
    )
)]
pub async fn import_code_handler(
    State(app_state): State<Arc<AppState>>,
    Json(body): Json<ImportCodeRequest>,
) -> ApiResult<impl IntoResponse> {
    let shared = share::decode(&body.code).map_err(port_error)?;
    let story = shared.into_story(app_state.library.story_layout());
    let saved = app_state
        .library
        .import_shared_story(story)
        .await
        .map_err(port_error)?;
    Ok((StatusCode::CREATED, Json(saved)))
}

//=========================================================================================
// History
//=========================================================================================

#[utoipa::path(
    get,
    path = "/history",
    responses((status = 200, description = "Read stories, most recent first, as `{data, loading, error}`"))
)]
pub async fn list_history_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.library.history())
}

/// Record that a story was read.
#[utoipa::path(
    post,
    path = "/history",
    request_body(content = Object, description = "A generated story"),
    responses((status = 200, description = "The history item for the story"))
)]
pub async fn read_story_handler(
    State(app_state): State<Arc<AppState>>,
    Json(story): Json<GeneratedStory>,
) -> ApiResult<impl IntoResponse> {
    let item = app_state
        .library
        .read_story(&story)
        .await
        .map_err(port_error)?;
    Ok(Json(item))
}

#[utoipa::path(
    delete,
    path = "/history/{id}",
    params(("id" = String, Path, description = "History item id")),
    responses((status = 204, description = "Deleted"))
)]
pub async fn delete_history_item_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app_state
        .library
        .delete_history_item(&id)
        .await
        .map_err(port_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/history",
    responses((status = 204, description = "History cleared"))
)]
pub async fn clear_history_handler(State(app_state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    app_state.library.clear_history().await.map_err(port_error)?;
    Ok(StatusCode::NO_CONTENT)
}

//=========================================================================================
// Characters
//=========================================================================================

#[utoipa::path(
    get,
    path = "/characters",
    responses((status = 200, description = "Characters as `{data, loading, error}`"))
)]
pub async fn list_characters_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.library.characters())
}

/// Create a character and paint its portrait. Counts against the daily character quota.
#[utoipa::path(
    post,
    path = "/characters",
    request_body = CreateCharacterRequest,
    responses(
        (status = 201, description = "The new character"),
        (status = 429, description = "Daily character quota used up")
    )
)]
pub async fn create_character_handler(
    State(app_state): State<Arc<AppState>>,
    Json(body): Json<CreateCharacterRequest>,
) -> ApiResult<impl IntoResponse> {
    let character = app_state
        .library
        .create_character(&body.name, &body.description)
        .await
        .map_err(port_error)?;
    Ok((StatusCode::CREATED, Json(character)))
}

#[utoipa::path(
    delete,
    path = "/characters/{id}",
    params(("id" = String, Path, description = "Character id")),
    responses((status = 204, description = "Deleted"))
)]
pub async fn delete_character_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app_state
        .library
        .delete_character(&id)
        .await
        .map_err(port_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/characters",
    responses((status = 204, description = "Every character was deleted"))
)]
pub async fn clear_characters_handler(
    State(app_state): State<Arc<AppState>>,
) -> ApiResult<StatusCode> {
    app_state
        .library
        .clear_characters()
        .await
        .map_err(port_error)?;
    Ok(StatusCode::NO_CONTENT)
}

//=========================================================================================
// Settings and Usage
//=========================================================================================

#[utoipa::path(
    get,
    path = "/settings",
    responses((status = 200, description = "Every stored setting by key"))
)]
pub async fn get_settings_handler(
    State(app_state): State<Arc<AppState>>,
) -> Json<BTreeMap<String, serde_json::Value>> {
    Json(app_state.library.settings())
}

/// Store a setting. `history-retention` and `story-layout` are validated.
#[utoipa::path(
    put,
    path = "/settings/{key}",
    params(("key" = String, Path, description = "Setting key")),
    request_body(content = Object, description = "Any JSON value"),
    responses(
        (status = 204, description = "Stored"),
        (status = 400, description = "Invalid value for a known setting")
    )
)]
pub async fn put_setting_handler(
    State(app_state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> ApiResult<StatusCode> {
    app_state
        .library
        .set_setting(&key, value)
        .await
        .map_err(port_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Today's usage of each rate-limited action.
#[utoipa::path(
    get,
    path = "/usage",
    responses((status = 200, description = "`{action, used, limit, remaining, blocked}` per action"))
)]
pub async fn usage_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.library.usage())
}

//=========================================================================================
// Generation
//=========================================================================================

#[utoipa::path(
    post,
    path = "/generate/ideas",
    request_body = IdeasRequest,
    responses(
        (status = 200, description = "A story idea"),
        (status = 502, description = "The generator failed")
    )
)]
pub async fn generate_ideas_handler(
    State(app_state): State<Arc<AppState>>,
    body: Option<Json<IdeasRequest>>,
) -> ApiResult<impl IntoResponse> {
    let category = body.and_then(|Json(b)| b.category);
    let prompt = app_state
        .library
        .generate_ideas(category.as_deref())
        .await
        .map_err(port_error)?;
    Ok(Json(prompt))
}

/// Generate and illustrate a story. Counts against the daily story quota.
#[utoipa::path(
    post,
    path = "/generate/story",
    request_body = GenerateStoryRequest,
    responses(
        (status = 200, description = "The generated, unsaved story"),
        (status = 400, description = "Incomplete prompt"),
        (status = 429, description = "Daily story quota used up"),
        (status = 502, description = "The generator failed")
    )
)]
pub async fn generate_story_handler(
    State(app_state): State<Arc<AppState>>,
    Json(body): Json<GenerateStoryRequest>,
) -> ApiResult<impl IntoResponse> {
    let story = app_state
        .library
        .create_story(body.prompt, body.layout, body.character_id.as_deref())
        .await
        .map_err(port_error)?;
    Ok(Json(story))
}

/// Turn a spoken request into a story idea.
///
/// Accepts a multipart/form-data request whose first part is the recording.
#[utoipa::path(
    post,
    path = "/generate/voice-prompt",
    request_body(content_type = "multipart/form-data", description = "The recorded audio."),
    responses(
        (status = 200, description = "A story idea built from the recording"),
        (status = 400, description = "Missing or empty recording")
    )
)]
pub async fn voice_prompt_handler(
    State(app_state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let audio = match multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("Failed to read multipart data: {}", e),
        )
    })? {
        Some(field) => field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                format!("Failed to read audio bytes: {}", e),
            )
        })?,
        None => {
            return Err((
                StatusCode::BAD_REQUEST,
                "Multipart form must include the recording".to_string(),
            ))
        }
    };

    let prompt = app_state
        .library
        .prompt_from_voice(&audio)
        .await
        .map_err(port_error)?;
    Ok(Json(prompt))
}

//=========================================================================================
// Backup
//=========================================================================================

/// Download every collection except usage counters as one JSON file.
#[utoipa::path(
    get,
    path = "/backup",
    responses((status = 200, description = "The backup document", content_type = "application/json"))
)]
pub async fn export_backup_handler(
    State(app_state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let backup = app_state
        .library
        .export_backup()
        .await
        .map_err(port_error)?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        app_state.library.backup_file_name()
    );
    Ok(([(header::CONTENT_DISPOSITION, disposition)], Json(backup)))
}

#[utoipa::path(
    post,
    path = "/backup/restore",
    request_body(content = Object, description = "A backup document"),
    responses(
        (status = 200, description = "Counts of restored records per collection"),
        (status = 400, description = "Not a backup file")
    )
)]
pub async fn restore_backup_handler(
    State(app_state): State<Arc<AppState>>,
    Json(document): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let summary = app_state
        .library
        .restore_backup(document)
        .await
        .map_err(port_error)?;
    Ok(Json(summary))
}
