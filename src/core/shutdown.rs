//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后：运行时不再接受新生成，进行中的生成被取消，
//! 等待所有 sequence 归还后 HTTP 服务再退出（SSE 流随终止事件结束）。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::runtime::ModelRuntime;

/// 检查 sequence 是否全部归还的间隔
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

/// 关闭信号：可克隆，任一副本触发后所有等待方被唤醒
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭；重复触发只记录第一次
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(?reason, "Initiating graceful shutdown...");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM（非 unix 平台只有 Ctrl+C）
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                Ok(()) = tokio::signal::ctrl_c() => ShutdownReason::UserInitiated,
                _ = terminate() => ShutdownReason::Signal,
                _ = manager.wait_for_shutdown() => return,
            };
            manager.shutdown(reason);
        });
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// 关闭时排空生成：关闭运行时，并在超时内等待 sequence 全部归还
pub struct GenerationDrain {
    runtime: Arc<ModelRuntime>,
    timeout: Duration,
}

impl GenerationDrain {
    pub fn new(runtime: Arc<ModelRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// 返回是否在超时前排空
    pub async fn run(&self) -> bool {
        let stopped = self.runtime.close();
        let drained = tokio::time::timeout(self.timeout, async {
            while !self.runtime.is_idle() {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();

        if drained {
            tracing::info!(stopped, "Generations drained");
        } else {
            tracing::warn!(
                stopped,
                timeout_secs = self.timeout.as_secs(),
                "Timed out waiting for generations to release their sequences"
            );
        }
        drained
    }
}
