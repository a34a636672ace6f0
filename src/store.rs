use crate::types::{Status, Transcribe, TranscribeFilter, Transcript, TranscriptFilter};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Transcribeの永続化
///
/// 削除は論理削除（`tm_delete` の設定）のみ。
#[async_trait]
pub trait TranscribeStore: Send + Sync {
    async fn transcribe_create(&self, transcribe: &Transcribe) -> Result<()>;

    async fn transcribe_get(&self, id: Uuid) -> Result<Option<Transcribe>>;

    async fn transcribe_get_by_reference_id_and_language(
        &self,
        reference_id: Uuid,
        language: &str,
    ) -> Result<Option<Transcribe>>;

    /// 作成日時の新しい順。`token` より前に作成されたものだけを返す
    async fn transcribe_list(
        &self,
        size: usize,
        token: Option<DateTime<Utc>>,
        filter: &TranscribeFilter,
    ) -> Result<Vec<Transcribe>>;

    async fn transcribe_set_status(&self, id: Uuid, status: Status) -> Result<()>;

    async fn transcribe_delete(&self, id: Uuid) -> Result<()>;
}

/// Transcriptの永続化
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn transcript_create(&self, transcript: &Transcript) -> Result<()>;

    async fn transcript_get(&self, id: Uuid) -> Result<Option<Transcript>>;

    async fn transcript_list(
        &self,
        size: usize,
        token: Option<DateTime<Utc>>,
        filter: &TranscriptFilter,
    ) -> Result<Vec<Transcript>>;

    async fn transcript_delete(&self, id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    transcribes: HashMap<Uuid, Transcribe>,
    transcripts: HashMap<Uuid, Transcript>,
}

/// メモリ上のストア
///
/// 単体テストや単一プロセス構成で使う。
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 保存されているTranscript数（論理削除済みを含む）
    pub fn transcript_count(&self) -> usize {
        self.lock().transcripts.len()
    }
}

fn paginate<T, F>(mut items: Vec<T>, size: usize, token: Option<DateTime<Utc>>, tm_create: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    if let Some(token) = token {
        items.retain(|item| tm_create(item) < token);
    }
    items.sort_by_key(|item| std::cmp::Reverse(tm_create(item)));
    items.truncate(size);
    items
}

#[async_trait]
impl TranscribeStore for MemoryStore {
    async fn transcribe_create(&self, transcribe: &Transcribe) -> Result<()> {
        let mut tables = self.lock();
        if tables.transcribes.contains_key(&transcribe.id) {
            anyhow::bail!("Transcribeが既に存在します: {}", transcribe.id);
        }

        let mut record = transcribe.clone();
        record.tm_create = Utc::now();
        record.tm_update = None;
        record.tm_delete = None;
        tables.transcribes.insert(record.id, record);
        Ok(())
    }

    async fn transcribe_get(&self, id: Uuid) -> Result<Option<Transcribe>> {
        Ok(self.lock().transcribes.get(&id).cloned())
    }

    async fn transcribe_get_by_reference_id_and_language(
        &self,
        reference_id: Uuid,
        language: &str,
    ) -> Result<Option<Transcribe>> {
        let tables = self.lock();
        let found = tables
            .transcribes
            .values()
            .filter(|t| t.reference_id == reference_id && t.language == language && !t.is_deleted())
            .max_by_key(|t| t.tm_create)
            .cloned();
        Ok(found)
    }

    async fn transcribe_list(
        &self,
        size: usize,
        token: Option<DateTime<Utc>>,
        filter: &TranscribeFilter,
    ) -> Result<Vec<Transcribe>> {
        let items: Vec<Transcribe> = self
            .lock()
            .transcribes
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        Ok(paginate(items, size, token, |t| t.tm_create))
    }

    async fn transcribe_set_status(&self, id: Uuid, status: Status) -> Result<()> {
        let mut tables = self.lock();
        let record = tables
            .transcribes
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Transcribeが見つかりません: {}", id))?;
        record.status = status;
        record.tm_update = Some(Utc::now());
        Ok(())
    }

    async fn transcribe_delete(&self, id: Uuid) -> Result<()> {
        let mut tables = self.lock();
        let record = tables
            .transcribes
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Transcribeが見つかりません: {}", id))?;
        let now = Utc::now();
        record.tm_update = Some(now);
        record.tm_delete = Some(now);
        Ok(())
    }
}

#[async_trait]
impl TranscriptStore for MemoryStore {
    async fn transcript_create(&self, transcript: &Transcript) -> Result<()> {
        let mut tables = self.lock();
        if tables.transcripts.contains_key(&transcript.id) {
            anyhow::bail!("Transcriptが既に存在します: {}", transcript.id);
        }

        let mut record = transcript.clone();
        record.tm_create = Utc::now();
        record.tm_delete = None;
        tables.transcripts.insert(record.id, record);
        Ok(())
    }

    async fn transcript_get(&self, id: Uuid) -> Result<Option<Transcript>> {
        Ok(self.lock().transcripts.get(&id).cloned())
    }

    async fn transcript_list(
        &self,
        size: usize,
        token: Option<DateTime<Utc>>,
        filter: &TranscriptFilter,
    ) -> Result<Vec<Transcript>> {
        let items: Vec<Transcript> = self
            .lock()
            .transcripts
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        Ok(paginate(items, size, token, |t| t.tm_create))
    }

    async fn transcript_delete(&self, id: Uuid) -> Result<()> {
        let mut tables = self.lock();
        let record = tables
            .transcripts
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Transcriptが見つかりません: {}", id))?;
        record.tm_delete = Some(Utc::now());
        Ok(())
    }
}
