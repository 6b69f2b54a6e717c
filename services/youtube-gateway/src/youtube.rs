//! YouTube Data API endpoints
//!
//! Each route validates its query parameters, shapes one upstream call and
//! hands it to the dispatcher. Upstream payloads are returned as-is except for
//! `/youtube/playlist/video-ids`, which reduces the playlist to its video ids.

use std::future::Future;
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::AppState;
use crate::error::{Error, Result};

const DEFAULT_MAX_RESULTS: u32 = 5;

/// YouTube caps list endpoints at 50 items per page.
const MAX_RESULTS_LIMIT: u32 = 50;

const VIDEO_PARTS: &str = "id,snippet,contentDetails,localizations,player,statistics,status,liveStreamingDetails,topicDetails,recordingDetails";
const CHANNEL_PARTS: &str =
    "id,snippet,statistics,status,topicDetails,contentDetails,brandingSettings,localizations";

/// Query parameters accepted across the YouTube routes.
///
/// Everything is optional here so missing or malformed values produce the
/// gateway's JSON error body instead of axum's plain-text rejection.
#[derive(Debug, Default, Deserialize)]
pub struct YoutubeQuery {
    pub q: Option<String>,
    pub channel_id: Option<String>,
    pub playlist_id: Option<String>,
    pub video_id: Option<String>,
    pub max_results: Option<String>,
}

/// One shaped upstream call.
#[derive(Debug, PartialEq)]
pub struct UpstreamCall {
    pub path: &'static str,
    pub params: Vec<(&'static str, String)>,
}

pub fn search_call(query: &YoutubeQuery) -> Result<UpstreamCall> {
    Ok(UpstreamCall {
        path: "search",
        params: vec![
            ("part", "id,snippet".into()),
            ("q", required(&query.q, "q")?),
            ("maxResults", max_results(&query.max_results)?.to_string()),
            ("type", "video".into()),
        ],
    })
}

pub fn channel_call(query: &YoutubeQuery) -> Result<UpstreamCall> {
    Ok(UpstreamCall {
        path: "channels",
        params: vec![
            ("part", CHANNEL_PARTS.into()),
            ("id", required(&query.channel_id, "channel_id")?),
        ],
    })
}

pub fn playlist_call(query: &YoutubeQuery) -> Result<UpstreamCall> {
    Ok(UpstreamCall {
        path: "playlistItems",
        params: vec![
            ("part", "snippet,contentDetails,status".into()),
            ("playlistId", required(&query.playlist_id, "playlist_id")?),
            ("maxResults", max_results(&query.max_results)?.to_string()),
        ],
    })
}

pub fn playlist_video_ids_call(query: &YoutubeQuery) -> Result<UpstreamCall> {
    Ok(UpstreamCall {
        path: "playlistItems",
        params: vec![
            ("part", "id,status,contentDetails".into()),
            ("playlistId", required(&query.playlist_id, "playlist_id")?),
            ("maxResults", max_results(&query.max_results)?.to_string()),
        ],
    })
}

pub fn video_call(query: &YoutubeQuery) -> Result<UpstreamCall> {
    Ok(UpstreamCall {
        path: "videos",
        params: vec![
            ("part", VIDEO_PARTS.into()),
            ("id", required(&query.video_id, "video_id")?),
            ("maxResults", max_results(&query.max_results)?.to_string()),
        ],
    })
}

fn required(value: &Option<String>, name: &'static str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_owned()),
        _ => Err(Error::MissingParam(name)),
    }
}

fn max_results(value: &Option<String>) -> Result<u32> {
    let Some(raw) = value.as_deref() else {
        return Ok(DEFAULT_MAX_RESULTS);
    };
    let n: u32 = raw.trim().parse().map_err(|_| Error::InvalidParam {
        name: "max_results",
        reason: format!("not a non-negative integer: {raw}"),
    })?;
    if n > MAX_RESULTS_LIMIT {
        return Err(Error::InvalidParam {
            name: "max_results",
            reason: format!("must be at most {MAX_RESULTS_LIMIT}, got {n}"),
        });
    }
    Ok(n)
}

/// `{"video_ids": [...]}` from a playlistItems payload.
pub fn extract_video_ids(payload: &Value) -> Value {
    let ids: Vec<Value> = payload
        .get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.pointer("/contentDetails/videoId"))
        .cloned()
        .collect();
    serde_json::json!({ "video_ids": ids })
}

async fn dispatch(state: &AppState, call: UpstreamCall) -> Result<Value> {
    Ok(state.dispatcher.request(call.path, &call.params).await?)
}

/// Run a route body, render its outcome and record request metrics.
async fn respond<F>(route: &'static str, body: F) -> Response
where
    F: Future<Output = Result<Value>>,
{
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let started = Instant::now();

    let response = match body.await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => {
            warn!(
                request_id = %request_id,
                route,
                error_type = e.error_type(),
                error = %e,
                "request failed"
            );
            e.into_response_with_id(&request_id)
        }
    };

    let status = response.status().as_u16();
    let elapsed = started.elapsed();
    crate::metrics::record_request(route, status, elapsed.as_secs_f64());
    info!(
        request_id = %request_id,
        route,
        status,
        duration_ms = elapsed.as_millis() as u64,
        "request completed"
    );
    response
}

pub async fn search(State(state): State<AppState>, Query(query): Query<YoutubeQuery>) -> Response {
    respond("search", async move { dispatch(&state, search_call(&query)?).await }).await
}

pub async fn channel(
    State(state): State<AppState>,
    Query(query): Query<YoutubeQuery>,
) -> Response {
    respond("channel", async move { dispatch(&state, channel_call(&query)?).await }).await
}

pub async fn playlist(
    State(state): State<AppState>,
    Query(query): Query<YoutubeQuery>,
) -> Response {
    respond("playlist", async move { dispatch(&state, playlist_call(&query)?).await }).await
}

pub async fn playlist_video_ids(
    State(state): State<AppState>,
    Query(query): Query<YoutubeQuery>,
) -> Response {
    respond("playlist_video_ids", async move {
        let payload = dispatch(&state, playlist_video_ids_call(&query)?).await?;
        Ok(extract_video_ids(&payload))
    })
    .await
}

pub async fn video(State(state): State<AppState>, Query(query): Query<YoutubeQuery>) -> Response {
    respond("video", async move { dispatch(&state, video_call(&query)?).await }).await
}
