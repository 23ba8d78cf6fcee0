use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use std::path::{Component, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    content::marshal::BrowseMode,
    content::object::ObjId,
    error::AppError,
    state::AppState,
    upnp::{SERVICE_CONNECTION_MANAGER, SERVICE_CONTENT_DIRECTORY},
    web::xml,
};

pub async fn root_handler() -> &'static str {
    "tonika UPnP music server"
}

pub async fn description_handler(State(state): State<AppState>) -> impl IntoResponse {
    xml_response(xml::generate_description_xml(&state.config))
}

pub async fn content_directory_scpd() -> impl IntoResponse {
    xml_response(xml::content_directory_scpd())
}

pub async fn connection_manager_scpd() -> impl IntoResponse {
    xml_response(xml::connection_manager_scpd())
}

fn xml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

fn soap_ok(body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/xml; charset=utf-8"),
            (header::HeaderName::from_static("ext"), ""),
        ],
        body,
    )
        .into_response()
}

fn soap_error(code: u32, description: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        xml::soap_fault(code, description),
    )
        .into_response()
}

/// The action name, taken from the SOAPAction header with a body sniff as
/// fallback for clients that omit the header.
fn action_name(headers: &HeaderMap, body: &str) -> Option<String> {
    if let Some(value) = headers.get("soapaction").and_then(|v| v.to_str().ok()) {
        if let Some(name) = xml::soap_action_name(value) {
            return Some(name.to_string());
        }
    }
    for action in [
        "GetSearchCapabilities",
        "GetSortCapabilities",
        "GetSystemUpdateID",
        "GetServiceResetToken",
        "GetProtocolInfo",
        "GetCurrentConnectionIDs",
        "GetCurrentConnectionInfo",
        "Browse",
    ] {
        if body.contains(&format!(":{action}")) {
            return Some(action.to_string());
        }
    }
    None
}

pub async fn content_directory_control(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    match action_name(&headers, &body).as_deref() {
        Some("Browse") => match browse_action(&state, &body).await {
            Ok(response) => soap_ok(response),
            Err((code, desc)) => soap_error(code, &desc),
        },
        Some("GetSystemUpdateID") => soap_ok(xml::soap_response(
            SERVICE_CONTENT_DIRECTORY,
            "GetSystemUpdateID",
            &[("Id", &state.vars.system_update_id().to_string())],
        )),
        Some("GetSearchCapabilities") => soap_ok(xml::soap_response(
            SERVICE_CONTENT_DIRECTORY,
            "GetSearchCapabilities",
            &[("SearchCaps", "")],
        )),
        Some("GetSortCapabilities") => soap_ok(xml::soap_response(
            SERVICE_CONTENT_DIRECTORY,
            "GetSortCapabilities",
            &[("SortCaps", "")],
        )),
        Some("GetServiceResetToken") => soap_ok(xml::soap_response(
            SERVICE_CONTENT_DIRECTORY,
            "GetServiceResetToken",
            &[("ResetToken", &state.vars.service_reset_token())],
        )),
        other => {
            debug!("unsupported ContentDirectory action: {other:?}");
            soap_error(401, "invalid action")
        }
    }
}

async fn browse_action(state: &AppState, body: &str) -> Result<String, (u32, String)> {
    let obj_id = xml::soap_arg(body, "ObjectID")
        .ok_or_else(|| (402u32, "no ObjectID passed to Browse action".to_string()))?;
    let id: ObjId = obj_id
        .parse()
        .map_err(|_| (402u32, format!("invalid ObjectID '{obj_id}' in Browse action")))?;

    let mode_raw = xml::soap_arg(body, "BrowseFlag")
        .ok_or_else(|| (402u32, "no BrowseFlag passed to Browse action".to_string()))?;
    let mode = BrowseMode::parse(&mode_raw)
        .ok_or_else(|| (402u32, format!("invalid BrowseFlag '{mode_raw}' in Browse action")))?;

    let start = xml::soap_arg(body, "StartingIndex")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let wanted = xml::soap_arg(body, "RequestedCount")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);

    let result = {
        let content = state.content.read().await;
        content.browse(id, mode, start, wanted)
    }
    .map_err(|e| match e {
        AppError::NotFound => (701u32, format!("no object found for id {id}")),
        AppError::InvalidArgument(desc) => (402u32, desc),
        other => (501u32, other.to_string()),
    })?;

    Ok(xml::soap_response(
        SERVICE_CONTENT_DIRECTORY,
        "Browse",
        &[
            ("Result", &result.didl),
            ("NumberReturned", &result.returned.to_string()),
            ("TotalMatches", &result.total.to_string()),
            ("UpdateID", &state.vars.system_update_id().to_string()),
        ],
    ))
}

pub async fn connection_manager_control(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    match action_name(&headers, &body).as_deref() {
        Some("GetProtocolInfo") => soap_ok(xml::soap_response(
            SERVICE_CONNECTION_MANAGER,
            "GetProtocolInfo",
            &[("Source", state.vars.source_protocol_info()), ("Sink", "")],
        )),
        // PrepareForConnection is not implemented, so the only id is 0
        Some("GetCurrentConnectionIDs") => soap_ok(xml::soap_response(
            SERVICE_CONNECTION_MANAGER,
            "GetCurrentConnectionIDs",
            &[("ConnectionIDs", "0")],
        )),
        Some("GetCurrentConnectionInfo") => soap_ok(xml::soap_response(
            SERVICE_CONNECTION_MANAGER,
            "GetCurrentConnectionInfo",
            &[
                ("RcsID", "-1"),
                ("AVTransportID", "-1"),
                ("ProtocolInfo", ""),
                ("PeerConnectionManager", ""),
                ("PeerConnectionID", "-1"),
                ("Direction", "Output"),
                ("Status", "OK"),
            ],
        )),
        other => {
            debug!("unsupported ConnectionManager action: {other:?}");
            soap_error(401, "invalid action")
        }
    }
}

/// Minimal GENA endpoint: accepts subscriptions so that clients watching
/// ContainerUpdateIDs/SystemUpdateID do not error out.
pub async fn event_subscribe() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (
                header::HeaderName::from_static("sid"),
                format!("uuid:{}", Uuid::new_v4()),
            ),
            (
                header::HeaderName::from_static("timeout"),
                "Second-1800".to_string(),
            ),
        ],
    )
}

fn parse_range_header(range_str: &str, file_size: u64) -> Result<(u64, u64), AppError> {
    // Parse range headers like "bytes=0-1023", "bytes=0-" or "bytes=-1024"
    if !range_str.starts_with("bytes=") {
        return Err(AppError::InvalidRange);
    }

    let range_part = &range_str[6..];
    let parts: Vec<&str> = range_part.split('-').collect();

    if parts.len() != 2 {
        return Err(AppError::InvalidRange);
    }

    let start_str = parts[0];
    let end_str = parts[1];

    let (start, end) = if start_str.is_empty() {
        // suffix range: the last N bytes
        if let Ok(suffix_length) = end_str.parse::<u64>() {
            let start = file_size.saturating_sub(suffix_length);
            (start, file_size - 1)
        } else {
            return Err(AppError::InvalidRange);
        }
    } else if end_str.is_empty() {
        // open range: from start to the end of the file
        if let Ok(start) = start_str.parse::<u64>() {
            if start >= file_size {
                return Err(AppError::InvalidRange);
            }
            (start, file_size - 1)
        } else {
            return Err(AppError::InvalidRange);
        }
    } else {
        let start = start_str.parse::<u64>().map_err(|_| AppError::InvalidRange)?;
        let end = end_str.parse::<u64>().map_err(|_| AppError::InvalidRange)?;

        if start > end || start >= file_size {
            return Err(AppError::InvalidRange);
        }

        (start, std::cmp::min(end, file_size - 1))
    };

    Ok((start, end))
}

/// Serves a track below one of the music dirs. External track URLs are
/// passed through as redirects; anything escaping every music dir is
/// rejected.
pub async fn serve_music(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    // external tracks carry their URL in the virtual path
    let external = if path.starts_with("http://") || path.starts_with("https://") {
        Some(path.clone())
    } else if let Some(rest) = path.strip_prefix("http:/") {
        Some(format!("http://{rest}"))
    } else if let Some(rest) = path.strip_prefix("https:/") {
        Some(format!("https://{rest}"))
    } else {
        None
    };
    if let Some(url) = external {
        return Ok(Redirect::temporary(&url).into_response());
    }

    let full = PathBuf::from(format!("/{path}"));
    if full
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    {
        warn!("rejecting music path '{}'", full.display());
        return Err(AppError::NotFound);
    }
    if state.config.music_dir_of(&full).is_none() {
        warn!(
            "rejecting music path '{}' outside every music dir",
            full.display()
        );
        return Err(AppError::NotFound);
    }

    let mut file = File::open(&full).await.map_err(AppError::Io)?;
    let file_size = file.metadata().await?.len();
    let mime = crate::content::fileinfo::mime_for_path(&full).unwrap_or("application/octet-stream");

    let mut response_builder = Response::builder()
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes");

    let (start, end) = if let Some(range_header) = headers.get(header::RANGE) {
        let range_str = range_header.to_str().map_err(|_| AppError::InvalidRange)?;
        debug!("received range request: {range_str}");
        parse_range_header(range_str, file_size)?
    } else {
        (0, file_size.saturating_sub(1))
    };

    let len = end - start + 1;

    let response_status = if len < file_size {
        response_builder = response_builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{file_size}"),
        );
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    response_builder = response_builder.header(header::CONTENT_LENGTH, len);

    file.seek(std::io::SeekFrom::Start(start)).await?;
    let stream = ReaderStream::with_capacity(file.take(len), 64 * 1024);
    let body = Body::from_stream(stream);

    Ok(response_builder.status(response_status).body(body)?)
}

/// Serves a cover picture as `/pictures/<id>.jpg`.
pub async fn serve_picture(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Response {
    let pic_id = file
        .strip_suffix(".jpg")
        .and_then(|raw| raw.parse::<u64>().ok());
    let bytes = match pic_id {
        Some(id) => state.pictures.get(id),
        None => None,
    };
    match bytes {
        Some(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg".to_string()),
                (header::CONTENT_LENGTH, bytes.len().to_string()),
            ],
            bytes.as_ref().clone(),
        )
            .into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("no picture for '{file}'"),
        )
            .into_response(),
    }
}

/// Runs one of the content diagnostics and writes it as plain text.
pub async fn content_report(
    State(state): State<AppState>,
    Path(command): Path<String>,
) -> Response {
    let report = {
        let content = state.content.read().await;
        content.report(&command)
    };
    match report {
        Some(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("unknown content report '{command}'"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_variants() {
        assert_eq!(parse_range_header("bytes=0-1023", 2048).unwrap(), (0, 1023));
        assert_eq!(parse_range_header("bytes=1024-", 2048).unwrap(), (1024, 2047));
        assert_eq!(parse_range_header("bytes=-100", 2048).unwrap(), (1948, 2047));
        // end clamped to the file size
        assert_eq!(parse_range_header("bytes=0-9999", 100).unwrap(), (0, 99));
        assert!(parse_range_header("bytes=2048-", 2048).is_err());
        assert!(parse_range_header("chunks=0-1", 10).is_err());
    }

    #[test]
    fn action_name_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "soapaction",
            "\"urn:schemas-upnp-org:service:ContentDirectory:1#Browse\""
                .parse()
                .unwrap(),
        );
        assert_eq!(
            action_name(&headers, "").as_deref(),
            Some("Browse")
        );
        let empty = HeaderMap::new();
        assert_eq!(
            action_name(&empty, "<u:GetSystemUpdateID xmlns:u=\"x\"/>").as_deref(),
            Some("GetSystemUpdateID")
        );
        assert_eq!(action_name(&empty, "nothing"), None);
    }
}
