use crate::config::AppConfig;
use crate::ipc::Ipc;
use std::sync::Arc;

/// Web 层的全局应用上下文。
///
/// 注意这里没有任何运行时状态: 控制端与监管器之间只通过
/// 数据目录里的 IPC 记录交互, 进程状态的唯一属主是监管器任务。
pub struct AppState {
    pub config: AppConfig,
    pub ipc: Ipc,
}

pub type SharedState = Arc<AppState>;
