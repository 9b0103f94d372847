mod backoff;
mod config;
mod ipc;
mod launcher;
mod monitor;
mod state;
mod supervisor;
mod web;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use config::AppConfig;
use ipc::Ipc;
use state::AppState;
use std::sync::Arc;
use supervisor::Supervisor;
use tracing::info;

/// VTX Cast - Unattended RTMP Push Supervisor
/// 解析命令行参数, 加载配置, 启动监管器任务和 HTTP 控制面
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-cast.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    info!(
        "VTX Cast initialized. Data dir: {}, Video dir: {}",
        config.server.data_dir.display(),
        config.server.video_dir.display()
    );

    // 数据目录与素材目录先建好, 监管器与 Web 层都依赖它们存在
    tokio::fs::create_dir_all(&config.server.data_dir).await?;
    tokio::fs::create_dir_all(&config.server.video_dir).await?;

    // 监管器任务: 状态机的唯一属主, 与这里只通过 IPC 文件交互
    tokio::spawn(Supervisor::new(config.clone()).run());

    let state = Arc::new(AppState {
        ipc: Ipc::new(config.server.data_dir.clone()),
        config: config.clone(),
    });

    let app = Router::new()
        .route("/", get(web::api::index_handler)) // 管理页面
        .route("/api/sys", get(web::api::sys_status)) // 系统状态
        .route("/api/stream/status", get(web::api::stream_status)) // 推流状态
        .route("/api/stream/start", post(web::api::handle_start)) // 开播
        .route("/api/stream/stop", post(web::api::handle_stop)) // 停播
        .route(
            "/api/stream/config",
            get(web::api::get_config).post(web::api::set_config), // 推流配置
        )
        .route("/api/videos", get(web::api::list_videos)) // 素材列表
        .route(
            "/api/videos/preview/:file_name",
            get(web::media::serve_video_preview), // 素材预览
        )
        .with_state(state);

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
