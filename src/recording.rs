use crate::error::Result;
use crate::external::RecordingStorage;
use crate::transcribe_backend::{AudioEncoding, BatchConfig, BatchRecognizer};
use crate::transcript::TranscriptHandler;
use crate::types::{Direction, RecordingInfo, Transcribe, Transcript};
use anyhow::Context;
use std::sync::Arc;
use uuid::Uuid;

/// 録音ファイルのサンプリングレート
const RECORDING_SAMPLE_RATE: u32 = 8000;

/// 録音ファイルのバッチ文字起こし
#[derive(Clone)]
pub struct RecordingHandler {
    storage: Arc<dyn RecordingStorage>,
    recognizer: Arc<dyn BatchRecognizer>,
    transcript_handler: TranscriptHandler,
}

impl RecordingHandler {
    pub fn new(
        storage: Arc<dyn RecordingStorage>,
        recognizer: Arc<dyn BatchRecognizer>,
        transcript_handler: TranscriptHandler,
    ) -> Self {
        Self {
            storage,
            recognizer,
            transcript_handler,
        }
    }

    pub async fn get_recording(&self, recording_id: Uuid) -> Result<RecordingInfo> {
        let recording = self
            .storage
            .get_recording(recording_id)
            .await
            .with_context(|| format!("録音情報の取得に失敗: {}", recording_id))?;
        Ok(recording)
    }

    /// 録音全体を認識し、1件のTranscriptとして保存
    ///
    /// 最初の結果の最有力候補のみを使う。方向は常に `Both`。
    pub async fn transcribe(&self, transcribe: &Transcribe) -> Result<Transcript> {
        let recording = self.get_recording(transcribe.reference_id).await?;

        let config = BatchConfig {
            encoding: AudioEncoding::Linear16,
            sample_rate: RECORDING_SAMPLE_RATE,
            language: transcribe.language.clone(),
        };
        log::info!(
            "録音の文字起こしを開始: {} (transcribe {}, {})",
            recording.id,
            transcribe.id,
            recording.bucket_uri
        );

        let results = self
            .recognizer
            .long_running_recognize(&recording.bucket_uri, &config)
            .await
            .with_context(|| format!("録音の認識に失敗: {}", recording.id))?;

        let message = results
            .first()
            .map(|r| r.text().to_string())
            .unwrap_or_default();
        if message.is_empty() {
            log::warn!("録音の認識結果が空です: {}", recording.id);
        }

        self.transcript_handler
            .create(
                transcribe.customer_id,
                transcribe.id,
                Direction::Both,
                &message,
                0,
            )
            .await
    }
}
