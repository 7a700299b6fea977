//! Sequence 池：固定数量的生成槽位（预热 1 个 + 若干并发请求）
//!
//! 使用 Semaphore 限制并发；租约（SequenceLease）在任何退出路径上 Drop 时释放 sequence 与槽位。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{GenerationSequence, LoadedModel};
use crate::core::EngineError;

pub struct SequencePool {
    model: Arc<dyn LoadedModel>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SequencePool {
    pub fn new(model: Arc<dyn LoadedModel>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            model,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前空闲槽位数
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn model(&self) -> &Arc<dyn LoadedModel> {
        &self.model
    }

    /// 等待空闲槽位并创建 sequence；等待期间被取消时返回 Ok(None)
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<SequenceLease>, EngineError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::PoolClosed)?
            }
        };

        let sequence = self.model.create_sequence()?;
        tracing::debug!(available = self.available(), "sequence acquired");
        Ok(Some(SequenceLease {
            sequence,
            _permit: permit,
        }))
    }
}

/// 对单个 sequence 的独占租约
pub struct SequenceLease {
    sequence: Box<dyn GenerationSequence>,
    _permit: OwnedSemaphorePermit,
}

impl SequenceLease {
    pub fn sequence(&mut self) -> &mut dyn GenerationSequence {
        self.sequence.as_mut()
    }
}

impl Drop for SequenceLease {
    fn drop(&mut self) {
        // 释放失败只记录，不覆盖本次生成的结果
        if let Err(e) = self.sequence.dispose() {
            tracing::debug!("sequence dispose failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    #[tokio::test]
    async fn test_lease_returns_slot_on_drop() {
        let engine = MockEngine::new();
        let pool = SequencePool::new(Arc::new(engine.clone()), 2);
        let cancel = CancellationToken::new();

        let lease = pool.acquire(&cancel).await.unwrap().unwrap();
        assert_eq!(pool.available(), 1);

        drop(lease);
        assert_eq!(pool.available(), 2);
        assert_eq!(engine.disposed_sequences(), 1);
    }

    #[tokio::test]
    async fn test_acquire_is_cancellable_when_exhausted() {
        let pool = SequencePool::new(Arc::new(MockEngine::new()), 1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap().unwrap();

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let lease = pool.acquire(&waiter_cancel).await.unwrap();
        assert!(lease.is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_capacity_is_at_least_one() {
        let pool = SequencePool::new(Arc::new(MockEngine::new()), 0);
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.available(), 1);
    }
}
