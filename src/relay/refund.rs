//! # 异步退款
//!
//! 上游失败后预扣额度在后台退还；并发受信号量限制，退款数据按值捕获。

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use super::quota::QuotaStore;
use crate::logging::{LogComponent, LogStage};
use crate::{lerror, linfo};

/// 一笔待退还的预扣额度
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub request_id: String,
    pub user_id: i32,
    pub token_id: i32,
    pub amount: i64,
}

/// 有界的后台退款任务池
#[derive(Clone)]
pub struct RefundPool {
    store: Arc<dyn QuotaStore>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl RefundPool {
    pub fn new(store: Arc<dyn QuotaStore>, workers: usize) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// 提交退款，立即返回
    pub fn submit(&self, refund: Refund) {
        if refund.amount <= 0 {
            return;
        }
        let store = self.store.clone();
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            Self::apply(store.as_ref(), &refund).await;
        });
    }

    async fn apply(store: &dyn QuotaStore, refund: &Refund) {
        let token = store.adjust_token(refund.token_id, -refund.amount).await;
        let user = store.adjust_user(refund.user_id, -refund.amount).await;
        match token.and(user) {
            Ok(()) => linfo!(
                refund.request_id,
                LogStage::BackgroundTask,
                LogComponent::Billing,
                "refund",
                "Pre-consumed quota refunded",
                user_id = refund.user_id,
                token_id = refund.token_id,
                amount = refund.amount
            ),
            Err(e) => lerror!(
                refund.request_id,
                LogStage::BackgroundTask,
                LogComponent::Billing,
                "refund_failed",
                "Failed to refund pre-consumed quota",
                user_id = refund.user_id,
                amount = refund.amount,
                error = %e
            ),
        }
    }

    /// 等待已提交的退款全部完成
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }
}
