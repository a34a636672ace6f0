use crate::types::{CallInfo, ConfbridgeInfo, ExternalMedia, ExternalMediaRequest, RecordingInfo};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// 通話制御サービス
#[async_trait]
pub trait CallControl: Send + Sync {
    async fn get_call(&self, call_id: Uuid) -> Result<CallInfo>;

    async fn get_confbridge(&self, confbridge_id: Uuid) -> Result<ConfbridgeInfo>;

    /// 通話の音声を指定アドレスへミラーする外部メディアブリッジを作成
    async fn create_external_media(&self, request: &ExternalMediaRequest) -> Result<ExternalMedia>;
}

/// 録音ファイルの保存先サービス
#[async_trait]
pub trait RecordingStorage: Send + Sync {
    async fn get_recording(&self, recording_id: Uuid) -> Result<RecordingInfo>;
}
