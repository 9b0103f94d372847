use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// Streams a video file from the media directory for the dashboard preview player.
pub async fn serve_video_preview(
    State(state): State<SharedState>,
    Path(file_name): Path<String>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // Only bare file names are accepted; anything path-like is rejected
    if !is_safe_name(&file_name) {
        return Err((StatusCode::BAD_REQUEST, "Invalid file name".to_string()));
    }

    let file_path = state.config.server.video_dir.join(&file_name);

    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // Determine the Content-Type based on the file extension
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .unwrap())
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() {
        assert!(!is_safe_name("../etc/passwd"));
        assert!(!is_safe_name("a/../b.mp4"));
        assert!(!is_safe_name("sub/dir.mp4"));
        assert!(!is_safe_name("win\\style.mp4"));
        assert!(!is_safe_name(""));
    }

    #[test]
    fn accepts_plain_file_names() {
        assert!(is_safe_name("intro.mp4"));
        assert!(is_safe_name("my video (1).mkv"));
    }
}
