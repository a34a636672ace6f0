use crate::error::Result;
use crate::transcribe::TranscribeHandler;
use crate::types::{CallStatus, ReferenceType, Status};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// ヘルスチェックの遅延再実行
pub trait HealthCheckScheduler: Send + Sync {
    /// `delay` 後に `(transcribe_id, retry_count)` のヘルスチェックを実行させる
    fn schedule(&self, transcribe_id: Uuid, delay: Duration, retry_count: u32) -> anyhow::Result<()>;
}

/// 予約済みヘルスチェック
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthCheckRequest {
    pub transcribe_id: Uuid,
    pub retry_count: u32,
}

/// 1回のヘルスチェックの結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    /// 次回を予約した
    Rescheduled { retry_count: u32 },
    /// 強制停止した
    Stopped,
    /// 既に終了していたので何もしない
    Finished,
}

/// tokioのタイマーで遅延させてキューへ積むスケジューラ
#[derive(Clone)]
pub struct DelayQueueScheduler {
    tx: mpsc::Sender<HealthCheckRequest>,
}

impl HealthCheckScheduler for DelayQueueScheduler {
    fn schedule(&self, transcribe_id: Uuid, delay: Duration, retry_count: u32) -> anyhow::Result<()> {
        if self.tx.is_closed() {
            anyhow::bail!("ヘルスチェックキューはクローズ済みです");
        }
        let runtime = tokio::runtime::Handle::try_current()
            .context("ヘルスチェックの予約にはtokioランタイムが必要です")?;

        let tx = self.tx.clone();
        let request = HealthCheckRequest {
            transcribe_id,
            retry_count,
        };
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(request).await.is_err() {
                log::debug!("ヘルスチェックキューがクローズされました: {}", transcribe_id);
            }
        });
        Ok(())
    }
}

/// ヘルスチェックの実行ループ
pub struct HealthCheckSupervisor {
    rx: mpsc::Receiver<HealthCheckRequest>,
}

impl HealthCheckSupervisor {
    /// スケジューラとスーパーバイザーの組を作成
    pub fn channel(capacity: usize) -> (DelayQueueScheduler, HealthCheckSupervisor) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (DelayQueueScheduler { tx }, HealthCheckSupervisor { rx })
    }

    /// 期限の来たヘルスチェックを順に実行
    ///
    /// 全てのスケジューラがドロップされるまで動き続ける。
    pub async fn run(mut self, handler: Arc<TranscribeHandler>) {
        log::info!("ヘルスチェックスーパーバイザーを開始");

        while let Some(request) = self.rx.recv().await {
            match handler
                .health_check(request.transcribe_id, request.retry_count)
                .await
            {
                Ok(outcome) => {
                    log::debug!("ヘルスチェック {}: {:?}", request.transcribe_id, outcome);
                }
                Err(e) => {
                    log::warn!("ヘルスチェック失敗 {}: {}", request.transcribe_id, e);
                }
            }
        }

        log::info!("ヘルスチェックスーパーバイザーを終了");
    }
}

impl TranscribeHandler {
    /// 稼働中のTranscribeの参照先を確認し、次回を予約する
    ///
    /// - `retry_count` が上限を超えていれば強制停止し、予約しない
    /// - Transcribeが終了・削除済みなら何もしない
    /// - 通話の取得自体が失敗した場合は即座に停止
    /// - 通話が切断・削除済みなら `retry_count` を増やす（会議は削除済みの場合）
    /// - 正常なら `retry_count` を 0 に戻す
    pub async fn health_check(&self, id: Uuid, retry_count: u32) -> Result<HealthCheckOutcome> {
        if retry_count > self.health_check.max_retry {
            log::warn!(
                "ヘルスチェックのリトライ上限を超えました。強制停止します: {} (retry {})",
                id,
                retry_count
            );
            self.stop(id).await?;
            return Ok(HealthCheckOutcome::Stopped);
        }

        let transcribe = match self.store.transcribe_get(id).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                log::debug!("ヘルスチェック: Transcribeが見つかりません: {}", id);
                return Ok(HealthCheckOutcome::Finished);
            }
            Err(e) => {
                log::warn!("ヘルスチェック: Transcribeを取得できません: {}: {}", id, e);
                return Ok(HealthCheckOutcome::Finished);
            }
        };
        if transcribe.status == Status::Done || transcribe.is_deleted() {
            return Ok(HealthCheckOutcome::Finished);
        }

        let next_retry = match transcribe.reference_type {
            ReferenceType::Call => match self.call_control.get_call(transcribe.reference_id).await {
                Ok(call) if call.deleted || call.status == CallStatus::Hangup => retry_count + 1,
                Ok(_) => 0,
                Err(e) => {
                    log::warn!(
                        "ヘルスチェック: 通話情報を取得できません。停止します: {} (call {}): {}",
                        id,
                        transcribe.reference_id,
                        e
                    );
                    self.stop(id).await?;
                    return Ok(HealthCheckOutcome::Stopped);
                }
            },
            ReferenceType::Conference => {
                match self.call_control.get_confbridge(transcribe.reference_id).await {
                    Ok(confbridge) if confbridge.deleted => retry_count + 1,
                    Ok(_) => 0,
                    Err(e) => {
                        log::warn!(
                            "ヘルスチェック: 会議情報を取得できません。停止します: {} (confbridge {}): {}",
                            id,
                            transcribe.reference_id,
                            e
                        );
                        self.stop(id).await?;
                        return Ok(HealthCheckOutcome::Stopped);
                    }
                }
            }
            ReferenceType::Recording => return Ok(HealthCheckOutcome::Finished),
        };

        if next_retry > 0 {
            log::info!("ヘルスチェック: 参照先が終了しています: {} (retry {})", id, next_retry);
        }

        self.scheduler
            .schedule(id, self.health_check.interval(), next_retry)
            .with_context(|| format!("ヘルスチェックを予約できません: {}", id))?;

        Ok(HealthCheckOutcome::Rescheduled {
            retry_count: next_retry,
        })
    }
}
