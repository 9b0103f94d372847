use crate::config::AppConfig;
use crate::ipc::{Ipc, StreamConfig, VideoSourceType};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// 支持的视频扩展名 (列目录时过滤)
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "flv"];

/// 已解析的编码器输入
#[derive(Debug, PartialEq)]
enum InputSpec {
    /// concat 列表文件 (单文件与播放列表都走这里)
    Concat { playlist: PathBuf },
    /// 静态图 + 可选音频循环
    StaticImage {
        image: PathBuf,
        audio: Option<PathBuf>,
    },
}

/// 编码器进程的构造与拉起。
///
/// 这里所有的校验失败 (缺配置、缺素材) 都是"自动重试也无济于事"的错误,
/// 由状态机转入 Failed 等待人工修正, 而不是进入退避重启。
pub struct Launcher {
    ffmpeg_binary: String,
    video_dir: PathBuf,
    ipc: Ipc,
}

impl Launcher {
    pub fn new(config: &AppConfig, ipc: Ipc) -> Self {
        Self {
            ffmpeg_binary: config.server.ffmpeg_binary.clone(),
            video_dir: config.server.video_dir.clone(),
            ipc,
        }
    }

    /// 校验配置、解析素材、拉起 FFmpeg。
    ///
    /// 成功时返回子进程句柄: stdout 为进度通道 (管道),
    /// stderr 追加写入 ffmpeg.log, 进程独立于监管器运行。
    pub async fn launch(&self) -> anyhow::Result<Child> {
        let cfg = self.ipc.read_stream_config().await?;

        if cfg.rtmp_url.trim().is_empty() || cfg.stream_key.trim().is_empty() {
            anyhow::bail!("RTMP URL or Stream Key is not configured.");
        }

        // 内存水位检查, 拿不到信息或水位低都只告警不阻断
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < 5120 => {
                warn!("Low system memory before launch ({} KB available)", mem.avail);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to check memory usage: {}", e),
        }

        let input = self.resolve_inputs(&cfg).await?;

        let output_url = format!(
            "{}/{}",
            cfg.rtmp_url.trim_end_matches('/'),
            cfg.stream_key.trim()
        );
        let args = build_args(&cfg, &input, &output_url);

        // 日志中隐去推流密钥
        info!(
            "Executing FFmpeg: {} {}",
            self.ffmpeg_binary,
            args.join(" ").replace(cfg.stream_key.trim(), "***")
        );

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ipc.encoder_log_path())?;

        let mut cmd = Command::new(&self.ffmpeg_binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        Ok(child)
    }

    /// 根据视频源类型解析素材并生成 concat 列表
    async fn resolve_inputs(&self, cfg: &StreamConfig) -> anyhow::Result<InputSpec> {
        match cfg.video_source_type {
            VideoSourceType::SingleFile => {
                if cfg.single_video_path.trim().is_empty() {
                    anyhow::bail!("Single file mode selected but no video path configured.");
                }
                let path = self.resolve_media_path(&cfg.single_video_path);
                if !path.exists() {
                    anyhow::bail!("Video file not found: {}", path.display());
                }
                self.write_playlist(&[path]).await
            }
            VideoSourceType::Playlist => {
                let files = if cfg.video_files.is_empty() {
                    self.enumerate_video_dir().await?
                } else {
                    // 前端选定的子集, 静默跳过已被删除的文件
                    cfg.video_files
                        .iter()
                        .map(|f| self.resolve_media_path(f))
                        .filter(|p| p.exists())
                        .collect()
                };
                if files.is_empty() {
                    anyhow::bail!("No video files found in video directory.");
                }
                self.write_playlist(&files).await
            }
            VideoSourceType::StaticImage => {
                if cfg.static_image_path.trim().is_empty() {
                    anyhow::bail!("Static image mode selected but no image path configured.");
                }
                let image = self.resolve_media_path(&cfg.static_image_path);
                if !image.exists() {
                    anyhow::bail!("Image file not found: {}", image.display());
                }
                let audio = if cfg.audio_path.trim().is_empty() {
                    None
                } else {
                    Some(self.resolve_media_path(&cfg.audio_path))
                };
                Ok(InputSpec::StaticImage { image, audio })
            }
        }
    }

    /// 列出素材目录下的全部视频文件 (按文件名排序保证播放顺序确定)
    async fn enumerate_video_dir(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.video_dir).await.map_err(|_| {
            anyhow::anyhow!("Video directory not found at {}", self.video_dir.display())
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_video_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// 生成 concat demuxer 列表文件
    async fn write_playlist(&self, files: &[PathBuf]) -> anyhow::Result<InputSpec> {
        let content: String = files
            .iter()
            // concat 格式要求单引号转义为 '\''
            .map(|p| format!("file '{}'\n", p.display().to_string().replace('\'', "'\\''")))
            .collect();
        let playlist = self.ipc.playlist_path();
        fs::write(&playlist, content).await?;
        Ok(InputSpec::Concat { playlist })
    }

    fn resolve_media_path(&self, configured: &str) -> PathBuf {
        let p = Path::new(configured);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.video_dir.join(configured)
        }
    }
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// 固定参数模板: x264 + aac, 2500k 码率, FLV 推到 RTMP 地址,
/// `-progress pipe:1` 把机器可读的进度行打到 stdout。
fn build_args(cfg: &StreamConfig, input: &InputSpec, output_url: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "info".into()];

    match input {
        InputSpec::Concat { playlist } => {
            args.extend([
                "-re".into(),
                "-f".into(),
                "concat".into(),
                "-safe".into(),
                "0".into(),
                "-i".into(),
                playlist.display().to_string(),
            ]);
        }
        InputSpec::StaticImage { image, audio } => {
            args.extend([
                "-re".into(),
                "-loop".into(),
                "1".into(),
                "-i".into(),
                image.display().to_string(),
            ]);
            if let Some(audio) = audio {
                args.extend(["-i".into(), audio.display().to_string(), "-shortest".into()]);
            }
        }
    }

    let preset = if cfg.preset.trim().is_empty() {
        "veryfast"
    } else {
        cfg.preset.trim()
    };

    args.extend([
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        preset.into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-r".into(),
        "30".into(),
        "-g".into(),
        "60".into(),
        "-keyint_min".into(),
        "60".into(),
        "-b:v".into(),
        "2500k".into(),
        "-maxrate".into(),
        "2800k".into(),
        "-bufsize".into(),
        "5000k".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-ar".into(),
        "44100".into(),
        "-ac".into(),
        "2".into(),
        "-f".into(),
        "flv".into(),
        output_url.into(),
        "-progress".into(),
        "pipe:1".into(),
    ]);

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn launcher_with_dirs() -> (tempfile::TempDir, tempfile::TempDir, Launcher, Ipc) {
        let data_dir = tempfile::tempdir().unwrap();
        let video_dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.server.video_dir = video_dir.path().to_path_buf();
        cfg.server.ffmpeg_binary = "true".to_string();
        let ipc = Ipc::new(data_dir.path());
        let launcher = Launcher::new(&cfg, ipc.clone());
        (data_dir, video_dir, launcher, ipc)
    }

    fn valid_stream_config() -> StreamConfig {
        let mut cfg = StreamConfig::default();
        cfg.stream_key = "key-123".to_string();
        cfg
    }

    #[tokio::test]
    async fn launch_fails_without_config_record() {
        let (_d, _v, launcher, _ipc) = launcher_with_dirs();
        let err = launcher.launch().await.unwrap_err();
        assert!(err.to_string().contains("config.json not found"));
    }

    #[tokio::test]
    async fn launch_fails_on_missing_stream_key() {
        let (_d, _v, launcher, ipc) = launcher_with_dirs();
        ipc.write_stream_config(&StreamConfig::default())
            .await
            .unwrap();
        let err = launcher.launch().await.unwrap_err();
        assert!(err.to_string().contains("Stream Key"));
    }

    #[tokio::test]
    async fn launch_fails_on_empty_video_dir() {
        let (_d, _v, launcher, ipc) = launcher_with_dirs();
        ipc.write_stream_config(&valid_stream_config())
            .await
            .unwrap();
        let err = launcher.launch().await.unwrap_err();
        assert!(err.to_string().contains("No video files"));
    }

    #[tokio::test]
    async fn launch_spawns_and_writes_playlist() {
        let (_d, video_dir, launcher, ipc) = launcher_with_dirs();
        tokio::fs::write(video_dir.path().join("a.mp4"), b"x")
            .await
            .unwrap();
        tokio::fs::write(video_dir.path().join("b.mkv"), b"x")
            .await
            .unwrap();
        tokio::fs::write(video_dir.path().join("notes.txt"), b"x")
            .await
            .unwrap();
        ipc.write_stream_config(&valid_stream_config())
            .await
            .unwrap();

        let mut child = launcher.launch().await.unwrap();
        assert!(child.id().is_some());
        let _ = child.wait().await;

        let playlist = tokio::fs::read_to_string(ipc.playlist_path()).await.unwrap();
        let lines: Vec<&str> = playlist.lines().collect();
        assert_eq!(lines.len(), 2, "txt files must be filtered out");
        assert!(lines[0].contains("a.mp4"));
        assert!(lines[1].contains("b.mkv"));
    }

    #[tokio::test]
    async fn single_file_mode_requires_existing_file() {
        let (_d, _v, launcher, ipc) = launcher_with_dirs();
        let mut cfg = valid_stream_config();
        cfg.video_source_type = VideoSourceType::SingleFile;
        cfg.single_video_path = "missing.mp4".to_string();
        ipc.write_stream_config(&cfg).await.unwrap();
        let err = launcher.launch().await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn build_args_concat_template() {
        let cfg = valid_stream_config();
        let input = InputSpec::Concat {
            playlist: PathBuf::from("/data/playlist.txt"),
        };
        let args = build_args(&cfg, &input, "rtmp://a.rtmp.youtube.com/live2/key-123");

        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i /data/playlist.txt"));
        assert!(joined.contains("-preset veryfast"));
        assert!(joined.contains("-b:v 2500k"));
        assert!(joined.contains("-f flv rtmp://a.rtmp.youtube.com/live2/key-123"));
        assert!(joined.ends_with("-progress pipe:1"));
    }

    #[test]
    fn build_args_respects_preset_override() {
        let mut cfg = valid_stream_config();
        cfg.preset = "slow".to_string();
        let input = InputSpec::Concat {
            playlist: PathBuf::from("/data/playlist.txt"),
        };
        let args = build_args(&cfg, &input, "rtmp://x/y");
        assert!(args.join(" ").contains("-preset slow"));
    }

    #[test]
    fn build_args_static_image_with_audio() {
        let cfg = valid_stream_config();
        let input = InputSpec::StaticImage {
            image: PathBuf::from("/videos/cover.png"),
            audio: Some(PathBuf::from("/videos/loop.mp3")),
        };
        let joined = build_args(&cfg, &input, "rtmp://x/y").join(" ");
        assert!(joined.contains("-loop 1 -i /videos/cover.png"));
        assert!(joined.contains("-i /videos/loop.mp3 -shortest"));
    }
}
