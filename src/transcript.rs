use crate::error::{Result, TranscribeError};
use crate::notify::NotifyHandler;
use crate::store::TranscriptStore;
use crate::types::{event_type, Direction, Transcript, TranscriptFilter};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Transcriptの作成・取得・削除
#[derive(Clone)]
pub struct TranscriptHandler {
    store: Arc<dyn TranscriptStore>,
    notify: NotifyHandler,
}

impl TranscriptHandler {
    pub fn new(store: Arc<dyn TranscriptStore>, notify: NotifyHandler) -> Self {
        Self { store, notify }
    }

    /// Transcriptを作成し `transcript_created` を発行
    pub async fn create(
        &self,
        customer_id: Uuid,
        transcribe_id: Uuid,
        direction: Direction,
        message: &str,
        tm_transcript_ms: u64,
    ) -> Result<Transcript> {
        let transcript = Transcript {
            id: Uuid::new_v4(),
            customer_id,
            transcribe_id,
            direction,
            message: message.to_string(),
            tm_transcript_ms,
            tm_create: Utc::now(),
            tm_delete: None,
        };

        self.store
            .transcript_create(&transcript)
            .await
            .with_context(|| format!("Transcriptの作成に失敗: transcribe {}", transcribe_id))?;

        let created = self.get(transcript.id).await?;
        log::debug!(
            "Transcriptを作成: {} (transcribe {}, {})",
            created.id,
            transcribe_id,
            direction
        );

        if let Err(e) =
            self.notify
                .publish_webhook_event(customer_id, event_type::TRANSCRIPT_CREATED, &created)
        {
            log::warn!("transcript_created を発行できません: {}", e);
        }

        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> Result<Transcript> {
        self.store
            .transcript_get(id)
            .await
            .with_context(|| format!("Transcriptの取得に失敗: {}", id))?
            .ok_or(TranscribeError::NotFound(id))
    }

    pub async fn list(
        &self,
        size: usize,
        token: Option<DateTime<Utc>>,
        filter: &TranscriptFilter,
    ) -> Result<Vec<Transcript>> {
        let transcripts = self
            .store
            .transcript_list(size, token, filter)
            .await
            .context("Transcript一覧の取得に失敗")?;
        Ok(transcripts)
    }

    /// 論理削除し `transcript_deleted` を発行
    pub async fn delete(&self, id: Uuid) -> Result<Transcript> {
        self.store
            .transcript_delete(id)
            .await
            .with_context(|| format!("Transcriptの削除に失敗: {}", id))?;

        let deleted = self.get(id).await?;
        if let Err(e) = self.notify.publish_webhook_event(
            deleted.customer_id,
            event_type::TRANSCRIPT_DELETED,
            &deleted,
        ) {
            log::warn!("transcript_deleted を発行できません: {}", e);
        }

        Ok(deleted)
    }
}
