use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TranscribeError;

/// 文字起こし対象のリファレンス種別
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    /// 通話（ストリーミング）
    Call,
    /// 会議（ストリーミング未実装）
    Conference,
    /// 録音ファイル（バッチ）
    Recording,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Call => "call",
            ReferenceType::Conference => "conference",
            ReferenceType::Recording => "recording",
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceType {
    type Err = TranscribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(ReferenceType::Call),
            "conference" => Ok(ReferenceType::Conference),
            "recording" => Ok(ReferenceType::Recording),
            other => Err(TranscribeError::InvalidReferenceType(other.to_string())),
        }
    }
}

/// 音声の方向
///
/// `In` は通話相手から、`Out` は通話相手へ向かう音声。
/// `Both` はセッション単位では `In` と `Out` の2本に展開される。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    Both,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::Both => "both",
        }
    }

    /// ストリーミングセッション単位の方向に展開
    ///
    /// # Examples
    ///
    /// ```
    /// # use call_transcribe::types::Direction;
    /// assert_eq!(Direction::Both.streaming_directions(), vec![Direction::In, Direction::Out]);
    /// assert_eq!(Direction::Out.streaming_directions(), vec![Direction::Out]);
    /// ```
    pub fn streaming_directions(self) -> Vec<Direction> {
        match self {
            Direction::Both => vec![Direction::In, Direction::Out],
            single => vec![single],
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "both" => Ok(Direction::Both),
            other => anyhow::bail!("無効な方向: {}", other),
        }
    }
}

/// Transcribeのステータス
///
/// `Progressing` → `Done` の一方向のみ遷移する。`Done` は終端。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Progressing,
    Done,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Progressing => "progressing",
            Status::Done => "done",
        }
    }

    /// 遷移可能かどうか
    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!((self, next), (Status::Progressing, Status::Done))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 文字起こしの集約ルート
///
/// # JSON出力例
///
/// ```json
/// {
///   "id": "0afbb01e-986c-11ed-9fdb-d3bf0303c51c",
///   "customer_id": "5d0166e6-877f-11ec-b42f-4f6a59ece023",
///   "reference_type": "call",
///   "reference_id": "8a9bc0b2-7f6b-11ed-8cad-5b6ec2832ff4",
///   "status": "progressing",
///   "host_id": "00000000-0000-0000-0000-000000000000",
///   "language": "en-US",
///   "direction": "both",
///   "streaming_ids": [],
///   "tm_create": "2025-01-02T14:30:15.234Z",
///   "tm_update": null,
///   "tm_delete": null
/// }
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Transcribe {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
    pub status: Status,
    /// 担当ホスト（振り分けには使わず値のみ保持）
    pub host_id: Uuid,
    /// BCP-47 言語タグ
    pub language: String,
    pub direction: Direction,
    pub streaming_ids: Vec<Uuid>,
    pub tm_create: DateTime<Utc>,
    pub tm_update: Option<DateTime<Utc>>,
    /// 論理削除時刻。`None` は未削除を表す
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Transcribe {
    pub fn is_deleted(&self) -> bool {
        self.tm_delete.is_some()
    }
}

/// 確定した文字起こし結果
///
/// 作成後は変更されず、論理削除のみ行われる。
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Transcript {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub transcribe_id: Uuid,
    pub direction: Direction,
    pub message: String,
    /// セッション開始からの経過時間（ミリ秒）
    pub tm_transcript_ms: u64,
    pub tm_create: DateTime<Utc>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Transcript {
    pub fn is_deleted(&self) -> bool {
        self.tm_delete.is_some()
    }
}

/// ストリーミングセッションの記録（永続化しない）
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Streaming {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub transcribe_id: Uuid,
    pub language: String,
    pub direction: Direction,
}

/// 発話イベントのペイロード
#[derive(Clone, Debug, Serialize)]
pub struct SpeechEvent {
    pub streaming_id: Uuid,
    pub transcribe_id: Uuid,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub tm_event: DateTime<Utc>,
}

/// Transcribe一覧の検索条件
#[derive(Clone, Debug, Default)]
pub struct TranscribeFilter {
    pub customer_id: Option<Uuid>,
    pub reference_id: Option<Uuid>,
    pub status: Option<Status>,
    pub deleted: Option<bool>,
}

impl TranscribeFilter {
    pub fn matches(&self, t: &Transcribe) -> bool {
        self.customer_id.map_or(true, |id| t.customer_id == id)
            && self.reference_id.map_or(true, |id| t.reference_id == id)
            && self.status.map_or(true, |s| t.status == s)
            && self.deleted.map_or(true, |d| t.is_deleted() == d)
    }
}

/// Transcript一覧の検索条件
#[derive(Clone, Debug, Default)]
pub struct TranscriptFilter {
    pub customer_id: Option<Uuid>,
    pub transcribe_id: Option<Uuid>,
    pub deleted: Option<bool>,
}

impl TranscriptFilter {
    pub fn matches(&self, t: &Transcript) -> bool {
        self.customer_id.map_or(true, |id| t.customer_id == id)
            && self.transcribe_id.map_or(true, |id| t.transcribe_id == id)
            && self.deleted.map_or(true, |d| t.is_deleted() == d)
    }
}

/// 通話のステータス（通話制御側の値）
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Dialing,
    Ringing,
    Progressing,
    Terminating,
    Canceling,
    Hangup,
}

/// 通話情報
#[derive(Clone, Debug)]
pub struct CallInfo {
    pub id: Uuid,
    pub status: CallStatus,
    pub deleted: bool,
}

/// 会議ブリッジ情報
#[derive(Clone, Debug)]
pub struct ConfbridgeInfo {
    pub id: Uuid,
    pub deleted: bool,
}

/// 録音情報
#[derive(Clone, Debug)]
pub struct RecordingInfo {
    pub id: Uuid,
    /// 録音ファイルの保存先URI
    pub bucket_uri: String,
}

/// 外部メディアブリッジの作成要求
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalMediaRequest {
    pub call_id: Uuid,
    /// 音声を送り込む先 ("ip:port")
    pub host_addr: String,
    pub encapsulation: &'static str,
    pub transport: &'static str,
    pub connection_type: &'static str,
    pub format: String,
    pub direction: Direction,
}

impl ExternalMediaRequest {
    pub fn new(call_id: Uuid, host_addr: String, format: String, direction: Direction) -> Self {
        Self {
            call_id,
            host_addr,
            encapsulation: "rtp",
            transport: "udp",
            connection_type: "client",
            format,
            direction,
        }
    }
}

/// 作成された外部メディアブリッジ
#[derive(Clone, Debug)]
pub struct ExternalMedia {
    pub media_addr_ip: String,
    pub media_addr_port: u16,
}

/// イベント種別
pub mod event_type {
    pub const TRANSCRIBE_CREATED: &str = "transcribe_created";
    pub const TRANSCRIBE_PROGRESSING: &str = "transcribe_progressing";
    pub const TRANSCRIBE_DONE: &str = "transcribe_done";
    pub const TRANSCRIBE_DELETED: &str = "transcribe_deleted";

    pub const TRANSCRIPT_CREATED: &str = "transcript_created";
    pub const TRANSCRIPT_DELETED: &str = "transcript_deleted";

    pub const STREAMING_STARTED: &str = "streaming_started";
    pub const STREAMING_STOPPED: &str = "streaming_stopped";

    pub const SPEECH_STARTED: &str = "speech_started";
    pub const SPEECH_INTERIM: &str = "speech_interim";
    pub const SPEECH_ENDED: &str = "speech_ended";
}
