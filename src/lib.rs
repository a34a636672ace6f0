//! call-transcribe - 通話音声のストリーミング文字起こしエンジン
//!
//! 通話の外部メディアブリッジから届くRTP音声をストリーミング音声認識サービスへ
//! 中継し、確定結果をTranscriptとして保存・通知します。
//!
//! # 主な機能
//!
//! - **RTP受信**: ランダムなUDPポートで受信し、RTCPを除いて音声を転送
//! - **ストリーミングセッション**: 方向（in/out）ごとに1本の認識ストリームを保持
//! - **ライフサイクル管理**: Transcribeの作成・停止・削除とセッションレジストリ
//! - **ヘルスチェック**: 通話が終了したまま残ったセッションを強制停止
//! - **録音の文字起こし**: 保存済み録音をバッチ認識
//!
//! # アーキテクチャ
//!
//! ```text
//! [Call Control] ──(external media)──→ [UDP socket]
//!                                           ↓
//!                                     [rtp::run_ingest]
//!                                           ↓
//!                                  [StreamingSession (×1|2)] ⇄ [StreamingProvider]
//!                                           ↓
//!                                   [TranscriptHandler] ──→ [NotifyHandler] ──→ [EventSink]
//!                                           ↑
//!   [HealthCheckSupervisor] ──→ [TranscribeHandler] ──→ [RecordingHandler] ⇄ [BatchRecognizer]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use call_transcribe::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//! config.validate().unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod aws_transcribe;
pub mod config;
pub mod error;
pub mod external;
pub mod g711;
pub mod health_check;
pub mod language;
pub mod notify;
pub mod recording;
pub mod registry;
pub mod rtp;
pub mod store;
pub mod streaming;
pub mod transcribe;
pub mod transcribe_backend;
pub mod transcript;
pub mod types;
pub mod whisper_api;

#[cfg(test)]
mod testutil;
