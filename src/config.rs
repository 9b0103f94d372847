use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP 监听地址
    #[serde(default = "default_listen")]
    pub listen: String,

    /// IPC 记录与日志的可写工作目录 (command.json / status.json / config.json / ffmpeg.log)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// 视频素材目录
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,

    /// FFmpeg 可执行文件路径
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// 命令轮询与状态发布周期 (毫秒)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// 卡死检测周期 (秒)
    #[serde(default = "default_stall_check_sec")]
    pub stall_check_sec: u64,

    /// 无心跳超过该阈值判定为卡死 (秒)
    #[serde(default = "default_stall_timeout_sec")]
    pub stall_timeout_sec: u64,

    /// 故障重试策略
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetryPolicy {
    /// 初始退避时间 (秒)
    #[serde(default = "default_initial_backoff_sec")]
    pub initial_backoff_sec: u64,
    /// 最大退避时间 (秒)
    #[serde(default = "default_max_backoff_sec")]
    pub max_backoff_sec: u64,
    /// 连续稳定运行超过该时长后退避归位 (秒)
    #[serde(default = "default_stability_sec")]
    pub stability_sec: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            video_dir: default_video_dir(),
            ffmpeg_binary: default_ffmpeg_binary(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stall_check_sec: default_stall_check_sec(),
            stall_timeout_sec: default_stall_timeout_sec(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_sec: default_initial_backoff_sec(),
            max_backoff_sec: default_max_backoff_sec(),
            stability_sec: default_stability_sec(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_video_dir() -> PathBuf {
    PathBuf::from("./videos")
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_stall_check_sec() -> u64 {
    10
}

fn default_stall_timeout_sec() -> u64 {
    30
}

fn default_initial_backoff_sec() -> u64 {
    5
}

fn default_max_backoff_sec() -> u64 {
    60
}

fn default_stability_sec() -> u64 {
    300
}

impl AppConfig {
    /// 加载配置文件；文件不存在时使用默认值 (允许纯环境变量部署)
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut config: AppConfig = if path.as_ref().exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        } else {
            AppConfig::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// 环境变量优先于配置文件 (systemd 部署通过 .env 注入绝对路径)
    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("DATA_DIR") {
            self.server.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("VIDEO_DIR") {
            self.server.video_dir = PathBuf::from(dir);
        }
        if let Ok(bin) = std::env::var("FFMPEG_PATH") {
            self.server.ffmpeg_binary = bin;
        }
    }
}
