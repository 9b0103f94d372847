use crate::ipc::{CommandKind, StreamConfig};
use crate::launcher::is_video_file;
use crate::state::SharedState;
use axum::{extract::State, http::StatusCode, Json};
use std::path::Path;
use tracing::error;

/// 提供内嵌的管理后台页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// 获取系统状态 API (内存与负载)
pub async fn sys_status() -> Json<serde_json::Value> {
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}

/// 获取推流状态 API。
/// 状态文件缺失时返回默认的 IDLE 记录, 前端永远能拿到合法结构。
pub async fn stream_status(State(state): State<SharedState>) -> Json<crate::ipc::LiveStatus> {
    Json(state.ipc.read_status().await)
}

/// 下发开播命令 (写入信箱, 由监管器在下个轮询周期消费)
pub async fn handle_start(
    State(state): State<SharedState>,
) -> (StatusCode, Json<serde_json::Value>) {
    issue_command(&state, CommandKind::Start, "Stream start command issued.").await
}

/// 下发停播命令
pub async fn handle_stop(
    State(state): State<SharedState>,
) -> (StatusCode, Json<serde_json::Value>) {
    issue_command(&state, CommandKind::Stop, "Stream stop command issued.").await
}

async fn issue_command(
    state: &SharedState,
    kind: CommandKind,
    accepted: &str,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.ipc.write_command(kind).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "message": accepted })),
        ),
        Err(e) => {
            error!("Failed to write command record: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "message": "Failed to issue command." })),
            )
        }
    }
}

/// 读取推流配置 (缺失时返回默认值供表单填充)
pub async fn get_config(State(state): State<SharedState>) -> Json<StreamConfig> {
    Json(state.ipc.read_stream_config_or_default().await)
}

/// 保存推流配置
pub async fn set_config(
    State(state): State<SharedState>,
    Json(config): Json<StreamConfig>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.ipc.write_stream_config(&config).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "message": "Configuration saved." })),
        ),
        Err(e) => {
            error!("Failed to save configuration: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "message": "Failed to save configuration." })),
            )
        }
    }
}

/// 获取素材目录下的视频列表
pub async fn list_videos(
    State(state): State<SharedState>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    match collect_videos(&state.config.server.video_dir).await {
        Ok(files) => Ok(Json(files)),
        Err(e) => {
            error!("Error reading video directory: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not list videos.".to_string(),
            ))
        }
    }
}

async fn collect_videos(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_video_file(&path) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.push(name.to_string());
            }
        }
    }
    files.sort();
    Ok(files)
}
