//! 文件型 IPC 协议: 监管器与控制端 (Web 层/CLI) 之间唯一的耦合点。
//!
//! 三个 JSON 记录各占一个文件, 每次整体原子覆盖 (临时文件 + rename),
//! 读方永远不会看到写了一半的记录:
//! - `command.json` — 单槽命令信箱, 按时间戳去重消费
//! - `status.json`  — 实时运行状态, 唯一事实来源
//! - `config.json`  — 推流配置, 由控制端写入, core 只读

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

/// 监管器状态机的枚举状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    #[default]
    Idle,
    Starting,
    Running,
    /// 退避等待期, 到点自动重新拉起
    Restarting,
    /// 不可自愈的失败 (配置错误等), 需要人工修正后重新 Start
    Failed,
    Stopped,
}

/// status.json 的完整结构, 对外可见的唯一事实来源
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatus {
    pub state: RunState,
    /// 当前持有的编码器进程号, 仅 Running 期间存在
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// 本次拉起后的运行秒数, 每次启动归零
    pub uptime_seconds: u64,
    /// 最近观测到的码率 (kbps), 未运行时为 0
    pub bitrate: f64,
    /// 非计划退出的累计次数, 只增不减
    pub restarts: u64,
    /// 最近一次心跳的 epoch 毫秒
    #[serde(default)]
    pub last_progress_timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            pid: None,
            uptime_seconds: 0,
            bitrate: 0.0,
            restarts: 0,
            last_progress_timestamp: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandKind {
    Start,
    Stop,
}

/// 单槽命令信箱的内容。只有时间戳严格大于上一条已执行命令的才会被执行,
/// 因此重复读取和重复写入都是幂等的。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandKind,
    pub timestamp: u64,
}

/// 视频源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoSourceType {
    SingleFile,
    #[default]
    Playlist,
    StaticImage,
}

/// config.json: 推流配置, 控制端拥有并修改, core 作为只读输入。
/// 排期字段仅为前端保留, core 不处理。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub rtmp_url: String,
    pub stream_key: String,
    pub video_source_type: VideoSourceType,
    pub single_video_path: String,
    pub static_image_path: String,
    pub audio_path: String,
    /// x264 preset 覆盖, 空串表示用默认值
    pub preset: String,
    /// 播放列表模式下选定的文件名; 为空表示目录下全部视频
    pub video_files: Vec<String>,
    pub is_scheduled: bool,
    pub start_time: String,
    pub duration_hours: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rtmp_url: "rtmp://a.rtmp.youtube.com/live2".to_string(),
            stream_key: String::new(),
            video_source_type: VideoSourceType::default(),
            single_video_path: String::new(),
            static_image_path: String::new(),
            audio_path: String::new(),
            preset: String::new(),
            video_files: Vec::new(),
            is_scheduled: false,
            start_time: String::new(),
            duration_hours: 0.0,
        }
    }
}

/// 当前 epoch 毫秒
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 数据目录内各 IPC 记录的读写入口
#[derive(Debug, Clone)]
pub struct Ipc {
    data_dir: PathBuf,
}

impl Ipc {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn command_path(&self) -> PathBuf {
        self.data_dir.join("command.json")
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join("status.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.data_dir.join("playlist.txt")
    }

    pub fn encoder_log_path(&self) -> PathBuf {
        self.data_dir.join("ffmpeg.log")
    }

    pub async fn ensure_data_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }

    /// 读取信箱。文件不存在或内容损坏都按"没有命令"处理。
    pub async fn read_command(&self) -> Option<Command> {
        let content = fs::read_to_string(self.command_path()).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    /// 控制端写入命令, 时间戳取当前时间
    pub async fn write_command(&self, kind: CommandKind) -> anyhow::Result<()> {
        let cmd = Command {
            command: kind,
            timestamp: now_ms(),
        };
        self.write_atomic(&self.command_path(), &serde_json::to_vec(&cmd)?)
            .await
    }

    /// 读取状态; 文件缺失时返回默认的 Idle 记录
    pub async fn read_status(&self) -> LiveStatus {
        match fs::read_to_string(self.status_path()).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => LiveStatus::default(),
        }
    }

    pub async fn write_status(&self, status: &LiveStatus) -> anyhow::Result<()> {
        self.write_atomic(&self.status_path(), &serde_json::to_vec_pretty(status)?)
            .await
    }

    /// core 侧读取推流配置; 文件缺失视为配置错误
    pub async fn read_stream_config(&self) -> anyhow::Result<StreamConfig> {
        let content = fs::read_to_string(self.config_path()).await.map_err(|_| {
            anyhow::anyhow!("config.json not found. Please configure the stream via the web UI.")
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 控制端读取推流配置; 缺失时返回默认值供表单填充
    pub async fn read_stream_config_or_default(&self) -> StreamConfig {
        self.read_stream_config().await.unwrap_or_default()
    }

    pub async fn write_stream_config(&self, config: &StreamConfig) -> anyhow::Result<()> {
        self.write_atomic(&self.config_path(), &serde_json::to_vec_pretty(config)?)
            .await
    }

    /// 原子覆盖写: 先写同目录临时文件再 rename, 并发读方不会读到半截记录
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipc_in_tempdir() -> (tempfile::TempDir, Ipc) {
        let dir = tempfile::tempdir().unwrap();
        let ipc = Ipc::new(dir.path());
        (dir, ipc)
    }

    #[tokio::test]
    async fn status_absent_returns_idle_default() {
        let (_dir, ipc) = ipc_in_tempdir();
        let status = ipc.read_status().await;
        assert_eq!(status.state, RunState::Idle);
        assert_eq!(status.uptime_seconds, 0);
        assert_eq!(status.bitrate, 0.0);
        assert_eq!(status.restarts, 0);
    }

    #[tokio::test]
    async fn status_round_trip_keeps_wire_names() {
        let (_dir, ipc) = ipc_in_tempdir();
        let status = LiveStatus {
            state: RunState::Running,
            pid: Some(4242),
            uptime_seconds: 17,
            bitrate: 2501.3,
            restarts: 2,
            last_progress_timestamp: 1_700_000_000_000,
            last_error: None,
        };
        ipc.write_status(&status).await.unwrap();

        let raw = tokio::fs::read_to_string(ipc.status_path()).await.unwrap();
        assert!(raw.contains("\"state\": \"RUNNING\""));
        assert!(raw.contains("\"uptimeSeconds\""));
        assert!(raw.contains("\"lastProgressTimestamp\""));
        assert!(!raw.contains("lastError"), "None fields must be omitted");

        let back = ipc.read_status().await;
        assert_eq!(back.state, RunState::Running);
        assert_eq!(back.pid, Some(4242));
        assert_eq!(back.restarts, 2);
    }

    #[tokio::test]
    async fn command_round_trip() {
        let (_dir, ipc) = ipc_in_tempdir();
        assert!(ipc.read_command().await.is_none());

        ipc.write_command(CommandKind::Start).await.unwrap();
        let cmd = ipc.read_command().await.unwrap();
        assert_eq!(cmd.command, CommandKind::Start);
        assert!(cmd.timestamp > 0);

        let raw = tokio::fs::read_to_string(ipc.command_path()).await.unwrap();
        assert!(raw.contains("\"command\":\"START\""));
    }

    #[tokio::test]
    async fn corrupt_command_is_ignored() {
        let (_dir, ipc) = ipc_in_tempdir();
        tokio::fs::write(ipc.command_path(), b"{not json")
            .await
            .unwrap();
        assert!(ipc.read_command().await.is_none());
    }

    #[tokio::test]
    async fn stream_config_defaults_and_round_trip() {
        let (_dir, ipc) = ipc_in_tempdir();
        assert!(ipc.read_stream_config().await.is_err());

        let defaults = ipc.read_stream_config_or_default().await;
        assert_eq!(defaults.rtmp_url, "rtmp://a.rtmp.youtube.com/live2");
        assert!(defaults.stream_key.is_empty());

        let mut cfg = StreamConfig::default();
        cfg.stream_key = "abcd-1234".to_string();
        cfg.video_source_type = VideoSourceType::SingleFile;
        cfg.single_video_path = "intro.mp4".to_string();
        ipc.write_stream_config(&cfg).await.unwrap();

        let raw = tokio::fs::read_to_string(ipc.config_path()).await.unwrap();
        assert!(raw.contains("\"videoSourceType\": \"SINGLE_FILE\""));

        let back = ipc.read_stream_config().await.unwrap();
        assert_eq!(back.stream_key, "abcd-1234");
        assert_eq!(back.video_source_type, VideoSourceType::SingleFile);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let (_dir, ipc) = ipc_in_tempdir();
        ipc.write_status(&LiveStatus::default()).await.unwrap();
        assert!(!ipc.status_path().with_extension("json.tmp").exists());
        assert!(ipc.status_path().exists());
    }
}
