use crate::backoff::Backoff;
use crate::config::AppConfig;
use crate::ipc::{now_ms, CommandKind, Ipc, LiveStatus, RunState};
use crate::launcher::Launcher;
use crate::monitor::parse_bitrate_kbps;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 推流监管器: 状态机与 LiveStatus 的唯一属主。
///
/// 单任务事件循环, 所有状态变更都串行经过这里:
/// - 命令轮询定时器 (默认 2s): 消费信箱、重新发布状态
/// - 计时定时器 (1s): 运行时长、子进程退出检测、退避到点重启、稳定归位
/// - 卡死检测定时器 (默认 10s): 心跳超时则强杀
/// - 进度通道: 每次拉起后由 stdout 读取任务投递进度行
///
/// 与控制端之间只通过数据目录里的 JSON 记录交互, 与编码器之间只通过
/// 标准流和信号交互, 不共享内存。
pub struct Supervisor {
    config: AppConfig,
    ipc: Ipc,
    launcher: Launcher,
    status: LiveStatus,
    backoff: Backoff,
    /// 最近一条已执行命令的时间戳, 旧于它的命令一律忽略
    last_command_ts: u64,
    child: Option<Child>,
    launched_at: Option<Instant>,
    /// 退避重启的到点时间, Stop 命令会清掉它
    restart_at: Option<Instant>,
    progress_tx: mpsc::Sender<String>,
    progress_rx: mpsc::Receiver<String>,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Self {
        let ipc = Ipc::new(config.server.data_dir.clone());
        let launcher = Launcher::new(&config, ipc.clone());
        let backoff = Backoff::new(config.supervisor.retry);
        let (progress_tx, progress_rx) = mpsc::channel(64);
        Self {
            config,
            ipc,
            launcher,
            status: LiveStatus::default(),
            backoff,
            last_command_ts: 0,
            child: None,
            launched_at: None,
            restart_at: None,
            progress_tx,
            progress_rx,
        }
    }

    /// 事件循环, 永不返回
    pub async fn run(mut self) {
        if let Err(e) = self.ipc.ensure_data_dir().await {
            error!("Failed to create data directory: {}", e);
        }
        self.publish().await;
        info!("Supervisor started. Data dir: {}", self.config.server.data_dir.display());

        let mut poll =
            tokio::time::interval(Duration::from_millis(self.config.supervisor.poll_interval_ms));
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut stall =
            tokio::time::interval(Duration::from_secs(self.config.supervisor.stall_check_sec));

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.poll_commands().await;
                    self.publish().await;
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
                _ = stall.tick() => {
                    self.check_stall();
                }
                Some(line) = self.progress_rx.recv() => {
                    self.on_progress_line(&line);
                }
            }
        }
    }

    /// 读信箱。只有时间戳严格更新的命令才会被执行 (重复读取幂等)。
    async fn poll_commands(&mut self) {
        let Some(cmd) = self.ipc.read_command().await else {
            return;
        };
        if cmd.timestamp <= self.last_command_ts {
            return;
        }
        self.last_command_ts = cmd.timestamp;
        info!("Received command: {:?}", cmd.command);
        self.apply_command(cmd.command).await;
    }

    async fn apply_command(&mut self, kind: CommandKind) {
        match kind {
            CommandKind::Start => match self.status.state {
                RunState::Running | RunState::Starting => {
                    info!("Stream is already running. Ignoring START.");
                }
                _ => {
                    // 手动 Start 视为操作员主动重试: 退避归位、取消待定的自动重启
                    self.backoff.reset();
                    self.restart_at = None;
                    self.start_encoder().await;
                }
            },
            CommandKind::Stop => match self.status.state {
                RunState::Running | RunState::Starting => {
                    self.stop_encoder().await;
                }
                RunState::Restarting => {
                    // 退避期内的 Stop 必须压过自动重启
                    info!("Stop received during backoff. Cancelling pending restart.");
                    self.restart_at = None;
                    self.mark_stopped();
                    self.publish().await;
                }
                _ => {
                    info!("Stream is not running. Ignoring STOP.");
                }
            },
        }
    }

    /// Starting → Running / Failed。
    /// 拉起失败一律 Failed (配置或素材问题, 自动重试无济于事), 不排重启。
    async fn start_encoder(&mut self) {
        self.status.state = RunState::Starting;
        self.publish().await;

        match self.launcher.launch().await {
            Ok(mut child) => {
                let pid = child.id();

                // stdout 读取任务: 只负责把进度行投递回事件循环, 不改状态
                if let Some(stdout) = child.stdout.take() {
                    let tx = self.progress_tx.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stdout).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                    });
                }

                self.child = Some(child);
                self.launched_at = Some(Instant::now());
                self.status.state = RunState::Running;
                self.status.pid = pid;
                self.status.uptime_seconds = 0;
                self.status.bitrate = 0.0;
                self.status.last_progress_timestamp = now_ms();
                self.status.last_error = None;
                info!("Encoder started (pid {:?})", pid);
            }
            Err(e) => {
                error!("Failed to start stream: {}", e);
                self.status.state = RunState::Failed;
                self.status.pid = None;
                self.status.last_error = Some(e.to_string());
            }
        }
        self.publish().await;
    }

    /// 优雅停止: SIGTERM 给 FFmpeg 收尾的机会, 5 秒不退再强杀。
    /// 收尸放到后台任务, 不阻塞命令轮询。
    async fn stop_encoder(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping stream (SIGTERM)...");
            signal_child(&child, nix::sys::signal::Signal::SIGTERM);
            tokio::spawn(async move {
                if tokio::time::timeout(Duration::from_secs(5), child.wait())
                    .await
                    .is_err()
                {
                    warn!("Encoder did not exit after SIGTERM. Killing.");
                    let _ = child.kill().await;
                }
            });
        }
        self.mark_stopped();
        self.publish().await;
    }

    fn mark_stopped(&mut self) {
        self.launched_at = None;
        self.status.state = RunState::Stopped;
        self.status.pid = None;
        self.status.uptime_seconds = 0;
        self.status.bitrate = 0.0;
    }

    /// 每秒一次: 运行时长、退出检测、稳定归位、退避到点重启
    async fn on_tick(&mut self) {
        self.check_child_exit().await;

        if self.status.state == RunState::Running {
            self.status.uptime_seconds += 1;

            // 持续稳定运行视为故障已解除, 退避归位 (与手动 Start 的归位相互独立)
            if let Some(at) = self.launched_at {
                if at.elapsed() >= self.backoff.stability_threshold() && self.backoff.is_elevated()
                {
                    info!("Stream has been stable. Resetting restart backoff.");
                    self.backoff.reset();
                }
            }
        }

        // 到点重启前必须复核状态: Stop 可能已经取消了这次重启
        if self.status.state == RunState::Restarting {
            if let Some(at) = self.restart_at {
                if Instant::now() >= at {
                    self.restart_at = None;
                    info!("Backoff elapsed. Attempting to restart stream.");
                    self.start_encoder().await;
                }
            }
        }
    }

    /// 子进程退出检测 (轮询 try_wait)。
    /// 走到这里的退出都是非计划的: 主动停止在 stop_encoder 里已把句柄移走。
    async fn check_child_exit(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(exit)) => {
                let detail = describe_exit(&exit);
                warn!("FFmpeg process exited unexpectedly ({})", detail);
                self.child = None;
                self.launched_at = None;

                self.status.state = RunState::Restarting;
                self.status.pid = None;
                self.status.uptime_seconds = 0;
                self.status.bitrate = 0.0;
                self.status.last_error = Some(format!("FFmpeg exited with {}", detail));
                self.status.restarts += 1;

                let delay = self.backoff.next_delay();
                self.restart_at = Some(Instant::now() + delay);
                info!(
                    "Restarting in {}s (restart #{})",
                    delay.as_secs(),
                    self.status.restarts
                );
                self.publish().await;
            }
            Ok(None) => {}
            Err(e) => error!("Process monitor error: {}", e),
        }
    }

    /// 心跳超时判定为卡死: 强杀但不收尸,
    /// 让退出走 check_child_exit 的非计划退出路径进入退避重启。
    fn check_stall(&mut self) {
        if self.status.state != RunState::Running {
            return;
        }
        let gap_ms = now_ms().saturating_sub(self.status.last_progress_timestamp);
        if gap_ms > self.config.supervisor.stall_timeout_sec * 1000 {
            error!(
                "Stream stalled. No progress received for {}s. Killing FFmpeg process.",
                gap_ms / 1000
            );
            if let Some(child) = &self.child {
                signal_child(child, nix::sys::signal::Signal::SIGKILL);
            }
        }
    }

    /// 进度行处理: 任何一行都刷新心跳, 码率能解析出来才更新
    fn on_progress_line(&mut self, line: &str) {
        if self.status.state != RunState::Running {
            return;
        }
        if let Some(kbps) = parse_bitrate_kbps(line) {
            self.status.bitrate = kbps;
        }
        self.status.last_progress_timestamp = now_ms();
    }

    /// 状态发布尽力而为: 写失败只降级可观测性, 不影响状态机
    async fn publish(&self) {
        if let Err(e) = self.ipc.write_status(&self.status).await {
            error!("Error writing status file: {}", e);
        }
    }
}

fn signal_child(child: &Child, sig: nix::sys::signal::Signal) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig);
    }
}

fn describe_exit(exit: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = exit.signal() {
            return format!("signal {}", sig);
        }
    }
    match exit.code() {
        Some(code) => format!("code {}", code),
        None => "unknown status".to_string(),
    }
}
