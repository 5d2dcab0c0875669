//! 可注入的时钟
//!
//! 轮询与问题应答中的所有等待都经过 [`Clock`]，测试可替换为立即返回的实现。

use std::time::Duration;

use async_trait::async_trait;

/// 时钟
#[async_trait]
pub trait Clock: Send + Sync {
    /// 挂起当前任务，由定时器唤醒
    async fn sleep(&self, duration: Duration);
}

/// 基于 tokio 定时器的时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_advances_paused_time() {
        let start = tokio::time::Instant::now();
        TokioClock.sleep(Duration::from_secs(2)).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
