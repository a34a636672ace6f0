use crate::config::{Config, HealthCheckConfig};
use crate::error::{Result, TranscribeError};
use crate::external::{CallControl, RecordingStorage};
use crate::health_check::HealthCheckScheduler;
use crate::language;
use crate::notify::NotifyHandler;
use crate::recording::RecordingHandler;
use crate::registry::SessionRegistry;
use crate::store::{TranscribeStore, TranscriptStore};
use crate::streaming::{StreamingHandler, StreamingSession};
use crate::transcribe_backend::{BatchRecognizer, StreamingProvider};
use crate::transcript::TranscriptHandler;
use crate::types::{
    event_type, CallStatus, Direction, ReferenceType, Status, Transcribe, TranscribeFilter,
    TranscriptFilter,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// カスケード削除時に一度に取得するTranscript数
const TRANSCRIPT_DELETE_PAGE_SIZE: usize = 1000;

/// `TranscribeHandler` が利用する外部コラボレータ一式
pub struct Dependencies {
    pub transcribe_store: Arc<dyn TranscribeStore>,
    pub transcript_store: Arc<dyn TranscriptStore>,
    pub call_control: Arc<dyn CallControl>,
    pub recording_storage: Arc<dyn RecordingStorage>,
    pub streaming_provider: Arc<dyn StreamingProvider>,
    pub batch_recognizer: Arc<dyn BatchRecognizer>,
    pub scheduler: Arc<dyn HealthCheckScheduler>,
    pub notify: NotifyHandler,
    pub registry: SessionRegistry,
}

/// Transcribeのライフサイクル管理
///
/// リファレンス種別ごとに開始・停止を振り分け、通話の場合は
/// ストリーミングセッションをレジストリに登録して保持する。
///
/// ```text
/// start(call) ──→ [StreamingSession ×1|2] ──→ registry ──→ health check
///     │
///     └─(recording)──→ [RecordingHandler] ──→ Transcript ×1
/// ```
pub struct TranscribeHandler {
    pub(crate) host_id: Uuid,
    pub(crate) health_check: HealthCheckConfig,
    pub(crate) store: Arc<dyn TranscribeStore>,
    pub(crate) call_control: Arc<dyn CallControl>,
    pub(crate) streaming_handler: StreamingHandler,
    pub(crate) recording_handler: RecordingHandler,
    pub(crate) transcript_handler: TranscriptHandler,
    pub(crate) scheduler: Arc<dyn HealthCheckScheduler>,
    pub(crate) notify: NotifyHandler,
    pub(crate) registry: SessionRegistry,
}

impl TranscribeHandler {
    pub fn new(config: &Config, deps: Dependencies) -> Self {
        let transcript_handler =
            TranscriptHandler::new(deps.transcript_store, deps.notify.clone());
        let streaming_handler = StreamingHandler::new(
            config.streaming.clone(),
            deps.streaming_provider,
            Arc::clone(&deps.call_control),
            transcript_handler.clone(),
            deps.notify.clone(),
            deps.registry.clone(),
        );
        let recording_handler = RecordingHandler::new(
            deps.recording_storage,
            deps.batch_recognizer,
            transcript_handler.clone(),
        );

        Self {
            host_id: config.host_id,
            health_check: config.health_check.clone(),
            store: deps.transcribe_store,
            call_control: deps.call_control,
            streaming_handler,
            recording_handler,
            transcript_handler,
            scheduler: deps.scheduler,
            notify: deps.notify,
            registry: deps.registry,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn transcript_handler(&self) -> &TranscriptHandler {
        &self.transcript_handler
    }

    /// Transcribeを作成し `transcribe_created` を発行
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        id: Uuid,
        customer_id: Uuid,
        reference_type: ReferenceType,
        reference_id: Uuid,
        language: &str,
        direction: Direction,
        streaming_ids: Vec<Uuid>,
    ) -> Result<Transcribe> {
        let transcribe = Transcribe {
            id,
            customer_id,
            reference_type,
            reference_id,
            status: Status::Progressing,
            host_id: self.host_id,
            language: language.to_string(),
            direction,
            streaming_ids,
            tm_create: Utc::now(),
            tm_update: None,
            tm_delete: None,
        };

        self.store
            .transcribe_create(&transcribe)
            .await
            .with_context(|| format!("Transcribeの作成に失敗: {}", id))?;

        let created = self.get(id).await?;
        log::info!(
            "Transcribeを作成: {} ({} {}, {}, {})",
            created.id,
            created.reference_type,
            created.reference_id,
            created.language,
            created.direction
        );

        if let Err(e) =
            self.notify
                .publish_webhook_event(customer_id, event_type::TRANSCRIBE_CREATED, &created)
        {
            log::warn!("transcribe_created を発行できません: {}", e);
        }

        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> Result<Transcribe> {
        self.store
            .transcribe_get(id)
            .await
            .with_context(|| format!("Transcribeの取得に失敗: {}", id))?
            .ok_or(TranscribeError::NotFound(id))
    }

    /// リファレンスと言語で検索（削除済みは除く）
    pub async fn get_by_reference_id_and_language(
        &self,
        reference_id: Uuid,
        language: &str,
    ) -> Result<Transcribe> {
        let language = language::normalize(language);
        self.store
            .transcribe_get_by_reference_id_and_language(reference_id, &language)
            .await
            .with_context(|| format!("Transcribeの検索に失敗: reference {}", reference_id))?
            .ok_or(TranscribeError::NotFound(reference_id))
    }

    pub async fn list(
        &self,
        size: usize,
        token: Option<DateTime<Utc>>,
        filter: &TranscribeFilter,
    ) -> Result<Vec<Transcribe>> {
        let transcribes = self
            .store
            .transcribe_list(size, token, filter)
            .await
            .context("Transcribe一覧の取得に失敗")?;
        Ok(transcribes)
    }

    /// 配下のTranscriptごと論理削除し `transcribe_deleted` を発行
    ///
    /// ステータスは変更しない。セッションの停止は `stop` で行う。
    pub async fn delete(&self, id: Uuid) -> Result<Transcribe> {
        // 存在確認
        self.get(id).await?;

        let deleted_transcripts = self.delete_transcripts(id).await?;

        self.store
            .transcribe_delete(id)
            .await
            .with_context(|| format!("Transcribeの削除に失敗: {}", id))?;

        let deleted = self.get(id).await?;
        log::info!(
            "Transcribeを削除: {} (Transcript {} 件)",
            id,
            deleted_transcripts
        );

        if let Err(e) = self.notify.publish_event(event_type::TRANSCRIBE_DELETED, &deleted) {
            log::warn!("transcribe_deleted を発行できません: {}", e);
        }

        Ok(deleted)
    }

    async fn delete_transcripts(&self, transcribe_id: Uuid) -> Result<usize> {
        let filter = TranscriptFilter {
            transcribe_id: Some(transcribe_id),
            deleted: Some(false),
            ..Default::default()
        };

        let mut count = 0;
        loop {
            // 削除済みはフィルタから外れるので常に先頭から取得する
            let page = self
                .transcript_handler
                .list(TRANSCRIPT_DELETE_PAGE_SIZE, None, &filter)
                .await?;
            if page.is_empty() {
                break;
            }

            for transcript in page {
                self.transcript_handler.delete(transcript.id).await?;
                count += 1;
            }
        }

        Ok(count)
    }

    /// ステータスを更新し、新しいステータスのイベントを発行
    pub async fn update_status(&self, id: Uuid, status: Status) -> Result<Transcribe> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(TranscribeError::InvalidStatus {
                from: current.status,
                to: status,
            });
        }

        self.store
            .transcribe_set_status(id, status)
            .await
            .with_context(|| format!("ステータスの更新に失敗: {}", id))?;

        let updated = self.get(id).await?;
        log::info!("Transcribeのステータスを更新: {} ({} -> {})", id, current.status, status);

        let event = match status {
            Status::Progressing => event_type::TRANSCRIBE_PROGRESSING,
            Status::Done => event_type::TRANSCRIBE_DONE,
        };
        if let Err(e) = self
            .notify
            .publish_webhook_event(updated.customer_id, event, &updated)
        {
            log::warn!("{} を発行できません: {}", event, e);
        }

        Ok(updated)
    }

    /// 文字起こしを開始
    ///
    /// リファレンスを検証し、言語タグを正規化してから種別ごとに振り分ける。
    pub async fn start(
        &self,
        customer_id: Uuid,
        reference_type: ReferenceType,
        reference_id: Uuid,
        language: &str,
        direction: Direction,
    ) -> Result<Transcribe> {
        self.validate_reference(reference_type, reference_id).await?;

        let language = language::normalize(language);

        match reference_type {
            ReferenceType::Call => {
                self.start_call(customer_id, reference_id, &language, direction)
                    .await
            }
            ReferenceType::Recording => {
                self.start_recording(customer_id, reference_id, &language)
                    .await
            }
            ReferenceType::Conference => {
                Err(TranscribeError::Unimplemented("conference streaming"))
            }
        }
    }

    async fn validate_reference(&self, reference_type: ReferenceType, reference_id: Uuid) -> Result<()> {
        match reference_type {
            ReferenceType::Call => {
                let call = self
                    .call_control
                    .get_call(reference_id)
                    .await
                    .with_context(|| format!("通話情報の取得に失敗: {}", reference_id))?;
                if call.deleted || call.status != CallStatus::Progressing {
                    return Err(TranscribeError::InvalidReferenceState(format!(
                        "通話 {} は通話中ではありません ({:?})",
                        reference_id, call.status
                    )));
                }
            }
            ReferenceType::Conference => {
                let confbridge = self
                    .call_control
                    .get_confbridge(reference_id)
                    .await
                    .with_context(|| format!("会議情報の取得に失敗: {}", reference_id))?;
                if confbridge.deleted {
                    return Err(TranscribeError::InvalidReferenceState(format!(
                        "会議 {} は削除済みです",
                        reference_id
                    )));
                }
            }
            ReferenceType::Recording => {
                self.recording_handler.get_recording(reference_id).await?;
            }
        }
        Ok(())
    }

    /// 通話のストリーミング文字起こしを開始
    ///
    /// 方向ごとにセッションを開始してからTranscribeを作成する。
    /// 途中で失敗した場合は開始済みのセッションを停止し、何も登録しない。
    /// セッションはレジストリ登録後に有効化されるため、失敗時には
    /// `streaming_*` イベントは一切発行されない。
    async fn start_call(
        &self,
        customer_id: Uuid,
        call_id: Uuid,
        language: &str,
        direction: Direction,
    ) -> Result<Transcribe> {
        let transcribe_id = Uuid::new_v4();

        let mut sessions: Vec<StreamingSession> = Vec::new();
        for session_direction in direction.streaming_directions() {
            match self
                .streaming_handler
                .start(customer_id, transcribe_id, call_id, language, session_direction)
                .await
            {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    log::error!(
                        "ストリーミングを開始できません: transcribe {} ({}): {}",
                        transcribe_id,
                        session_direction,
                        e
                    );
                    self.stop_sessions(&sessions);
                    return Err(e);
                }
            }
        }

        let streaming_ids = sessions.iter().map(StreamingSession::id).collect();
        let transcribe = match self
            .create(
                transcribe_id,
                customer_id,
                ReferenceType::Call,
                call_id,
                language,
                direction,
                streaming_ids,
            )
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.stop_sessions(&sessions);
                return Err(e);
            }
        };

        self.registry.insert(transcribe_id, sessions.clone());
        for session in &sessions {
            self.streaming_handler.activate(session);
        }

        if let Err(e) = self
            .scheduler
            .schedule(transcribe_id, self.health_check.interval(), 0)
        {
            log::warn!("ヘルスチェックを予約できません: {}: {}", transcribe_id, e);
        }

        Ok(transcribe)
    }

    /// 録音ファイルの文字起こし（完了まで待機）
    async fn start_recording(
        &self,
        customer_id: Uuid,
        recording_id: Uuid,
        language: &str,
    ) -> Result<Transcribe> {
        let transcribe = self
            .create(
                Uuid::new_v4(),
                customer_id,
                ReferenceType::Recording,
                recording_id,
                language,
                Direction::Both,
                Vec::new(),
            )
            .await?;

        if let Err(e) = self.recording_handler.transcribe(&transcribe).await {
            log::error!("録音の文字起こしに失敗: transcribe {}: {}", transcribe.id, e);
            if let Err(update_err) = self.update_status(transcribe.id, Status::Done).await {
                log::warn!("ステータスを更新できません: {}: {}", transcribe.id, update_err);
            }
            return Err(e);
        }

        self.update_status(transcribe.id, Status::Done).await
    }

    /// 文字起こしを停止
    ///
    /// 進行中のTranscribeのみ停止できる。通話の場合は全セッションを停止して
    /// レジストリから取り除いてから `done` にする。
    pub async fn stop(&self, id: Uuid) -> Result<Transcribe> {
        let transcribe = self.get(id).await?;
        if transcribe.status != Status::Progressing {
            return Err(TranscribeError::InvalidStatus {
                from: transcribe.status,
                to: Status::Done,
            });
        }

        match transcribe.reference_type {
            ReferenceType::Call => {
                let sessions = self.registry.remove(id).unwrap_or_default();
                log::info!("Transcribeを停止: {} (セッション {} 件)", id, sessions.len());
                self.stop_sessions(&sessions);
            }
            ReferenceType::Conference => {
                return Err(TranscribeError::Unimplemented("conference streaming"));
            }
            other => {
                return Err(TranscribeError::InvalidReferenceType(other.to_string()));
            }
        }

        self.update_status(id, Status::Done).await
    }

    /// セッションを個別に停止（1つの失敗が他を妨げない）
    fn stop_sessions(&self, sessions: &[StreamingSession]) {
        for session in sessions {
            self.streaming_handler.stop(session);
        }
    }
}
