use crate::error::{Result, TranscribeError};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 配信するイベント
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    /// Webhook配信先の顧客（内部イベントは `None`）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn is_webhook(&self) -> bool {
        self.customer_id.is_some()
    }
}

/// イベントの配信先（メッセージキューやWebhook送信部）
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()>;
}

/// 配信結果の集計
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
}

/// イベント通知ハンドラ
///
/// 有界キューに積み、単一のワーカータスクが順に `EventSink` へ配信する。
/// 発行側はブロックしない。キューが満杯またはクローズ済みならエラーを返す。
#[derive(Clone)]
pub struct NotifyHandler {
    tx: mpsc::Sender<Event>,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    worker: Arc<Mutex<Option<JoinHandle<DeliveryStats>>>>,
}

impl NotifyHandler {
    /// ワーカータスクを起動して作成（tokioランタイム内で呼ぶこと）
    pub fn new(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = tokio::spawn(run_worker(rx, sink, shutdown_rx));

        Self {
            tx,
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// 内部イベントを発行
    pub fn publish_event<T: Serialize>(&self, event_type: &str, payload: &T) -> Result<()> {
        self.enqueue(None, event_type, payload)
    }

    /// 顧客向けWebhookイベントを発行
    pub fn publish_webhook_event<T: Serialize>(
        &self,
        customer_id: Uuid,
        event_type: &str,
        payload: &T,
    ) -> Result<()> {
        self.enqueue(Some(customer_id), event_type, payload)
    }

    fn enqueue<T: Serialize>(
        &self,
        customer_id: Option<Uuid>,
        event_type: &str,
        payload: &T,
    ) -> Result<()> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| TranscribeError::Notify(format!("ペイロードのシリアライズに失敗: {}", e)))?;
        let event = Event {
            customer_id,
            event_type: event_type.to_string(),
            payload,
        };

        self.tx
            .try_send(event)
            .map_err(|e| TranscribeError::Notify(format!("{}: {}", event_type, e)))
    }

    /// キューを閉じ、残りを配信し終えるまで待つ
    ///
    /// 2回目以降の呼び出しは空の集計を返す。
    pub async fn shutdown(&self) -> DeliveryStats {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match worker {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                log::error!("通知ワーカーが異常終了しました: {}", e);
                DeliveryStats::default()
            }),
            None => DeliveryStats::default(),
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Event>,
    sink: Arc<dyn EventSink>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    let mut closing = false;

    loop {
        let event = if closing {
            rx.recv().await
        } else {
            tokio::select! {
                event = rx.recv() => event,
                _ = &mut shutdown_rx => {
                    // 以降の発行を拒否し、積まれている分だけ配信する
                    rx.close();
                    closing = true;
                    continue;
                }
            }
        };

        let Some(event) = event else {
            break;
        };

        match sink.deliver(&event).await {
            Ok(()) => stats.delivered += 1,
            Err(e) => {
                stats.failed += 1;
                log::error!("イベント配信失敗: {} - {:?}", event.event_type, e);
            }
        }
    }

    log::debug!(
        "通知ワーカーを終了: 配信 {} 件, 失敗 {} 件",
        stats.delivered,
        stats.failed
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::CapturingSink;

    #[tokio::test]
    async fn test_publish_and_shutdown() {
        let sink = Arc::new(CapturingSink::default());
        let notify = NotifyHandler::new(sink.clone(), 8);
        let customer_id = Uuid::new_v4();

        notify
            .publish_webhook_event(customer_id, "transcribe_created", &serde_json::json!({"id": 1}))
            .unwrap();
        notify
            .publish_event("transcribe_deleted", &serde_json::json!({"id": 1}))
            .unwrap();

        let stats = notify.shutdown().await;
        assert_eq!(stats, DeliveryStats { delivered: 2, failed: 0 });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].customer_id, Some(customer_id));
        assert!(events[0].is_webhook());
        assert!(!events[1].is_webhook());
        assert_eq!(events[1].payload["id"], 1);

        // クローズ後の発行はエラー
        assert!(notify.publish_event("late", &()).is_err());
        assert_eq!(notify.shutdown().await, DeliveryStats::default());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_counted() {
        let sink = Arc::new(CapturingSink::failing());
        let notify = NotifyHandler::new(sink.clone(), 8);

        notify.publish_event("transcript_created", &()).unwrap();

        let stats = notify.shutdown().await;
        assert_eq!(stats, DeliveryStats { delivered: 0, failed: 1 });
    }

    #[tokio::test]
    async fn test_queue_full_is_reported() {
        let sink = Arc::new(CapturingSink::blocked());
        let notify = NotifyHandler::new(sink.clone(), 1);

        // ワーカーが1件を処理中、キューに1件で満杯になる
        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(notify.publish_event("speech_interim", &()));
            tokio::task::yield_now().await;
        }
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(TranscribeError::Notify(_)))));

        sink.unblock();
        notify.shutdown().await;
    }
}
