use crate::config::RetryPolicy;
use std::time::Duration;

/// 指数退避状态 (基于配置的 RetryPolicy)。
///
/// 每次非计划退出消耗一次当前退避值, 之后翻倍, 封顶于 max。
/// 两种情况下归位到初始值, 互相独立:
/// - 操作员手动下发 Start (主动重试, 既往不咎)
/// - 连续稳定运行超过 stability 阈值 (由监管器在计时心跳里触发)
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: Duration::from_secs(policy.initial_backoff_sec),
        }
    }

    /// 取本次重启应等待的时长, 并将下一次的退避翻倍 (封顶 max)
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let doubled = self.current.saturating_mul(2);
        self.current = doubled.min(Duration::from_secs(self.policy.max_backoff_sec));
        delay
    }

    /// 归位到初始退避值
    pub fn reset(&mut self) {
        self.current = Duration::from_secs(self.policy.initial_backoff_sec);
    }

    /// 当前退避是否已经高于初始值 (用于避免重复打归位日志)
    pub fn is_elevated(&self) -> bool {
        self.current > Duration::from_secs(self.policy.initial_backoff_sec)
    }

    pub fn stability_threshold(&self) -> Duration {
        Duration::from_secs(self.policy.stability_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(RetryPolicy {
            initial_backoff_sec: 5,
            max_backoff_sec: 60,
            stability_sec: 300,
        })
    }

    #[test]
    fn doubles_and_caps_at_max() {
        let mut b = backoff();
        let secs: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = backoff();
        for _ in 0..4 {
            b.next_delay();
        }
        assert!(b.is_elevated());
        b.reset();
        assert!(!b.is_elevated());
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn fresh_backoff_is_not_elevated() {
        let mut b = backoff();
        assert!(!b.is_elevated());
        b.next_delay();
        assert!(b.is_elevated());
    }
}
