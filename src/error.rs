use crate::transcribe_backend::AudioEncoding;
use crate::types::Status;
use uuid::Uuid;

/// 文字起こしエンジンのエラー
///
/// 外部コラボレータ由来のエラーは `Other` に包んで返す。
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    #[error("見つかりません: {0}")]
    NotFound(Uuid),

    #[error("無効なリファレンスタイプ: {0}")]
    InvalidReferenceType(String),

    #[error("リファレンスの状態が無効です: {0}")]
    InvalidReferenceState(String),

    #[error("無効なステータス遷移: {from} -> {to}")]
    InvalidStatus { from: Status, to: Status },

    #[error("利用可能なポートがありません")]
    NoAvailablePort,

    #[error("{provider} は {encoding:?} の音声に対応していません")]
    UnsupportedEncoding {
        provider: &'static str,
        encoding: AudioEncoding,
    },

    #[error("未実装: {0}")]
    Unimplemented(&'static str),

    #[error("通知キューエラー: {0}")]
    Notify(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TranscribeError>;
