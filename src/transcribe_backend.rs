use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 認識サービスへ送る音声のエンコーディング
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// G.711 μ-law
    Mulaw,
    /// 16ビット符号付きリニアPCM
    Linear16,
}

impl AudioEncoding {
    /// 外部メディアのフォーマット名から変換
    pub fn from_media_format(format: &str) -> Option<Self> {
        match format {
            "ulaw" => Some(AudioEncoding::Mulaw),
            "slin" => Some(AudioEncoding::Linear16),
            _ => None,
        }
    }
}

/// ストリーム開始時に一度だけ送る設定フレーム
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
    pub punctuation: bool,
    pub interim_results: bool,
}

/// 双方向ストリームの送信フレーム
#[derive(Clone, Debug, PartialEq)]
pub enum StreamRequest {
    Config(StreamConfig),
    /// RTPヘッダを除いた音声バイト列
    Audio(Vec<u8>),
}

/// 認識結果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecognitionResult {
    /// true: 確定結果, false: 中間結果
    pub is_final: bool,
    /// 候補テキスト（先頭が最有力）
    pub alternatives: Vec<String>,
}

impl RecognitionResult {
    pub fn interim(text: &str) -> Self {
        Self {
            is_final: false,
            alternatives: vec![text.to_string()],
        }
    }

    pub fn final_result(text: &str) -> Self {
        Self {
            is_final: true,
            alternatives: vec![text.to_string()],
        }
    }

    /// 最有力候補のテキスト
    pub fn text(&self) -> &str {
        self.alternatives.first().map(String::as_str).unwrap_or_default()
    }
}

/// 双方向ストリームの受信フレーム
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamResponse {
    pub results: Vec<RecognitionResult>,
}

/// ストリーミング認識サービスの共通トレイト
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    /// 双方向ストリームを開く
    ///
    /// # Returns
    /// (送信チャンネル, 受信チャンネル) のタプル
    /// - 送信チャンネル: 最初に `StreamRequest::Config`、以降は音声を送る。
    ///   ドロップすると送信側がクローズされる
    /// - 受信チャンネル: 認識結果。エラーを受け取るかクローズされたら終了
    async fn open_stream(
        &self,
    ) -> Result<(mpsc::Sender<StreamRequest>, mpsc::Receiver<Result<StreamResponse>>)>;

    /// ログ用のプロバイダ名
    fn name(&self) -> &'static str;

    /// 指定エンコーディングの音声を受け付けるか
    ///
    /// 外部メディアブリッジを作る前に確認される。
    fn supports(&self, _encoding: AudioEncoding) -> bool {
        true
    }
}

/// バッチ認識の設定
#[derive(Clone, Debug, PartialEq)]
pub struct BatchConfig {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub language: String,
}

/// 長時間実行型のバッチ認識サービス
#[async_trait]
pub trait BatchRecognizer: Send + Sync {
    /// 保存済み音声を認識し、完了まで待機する
    ///
    /// タイムアウトは認識サービス側に任せる。
    async fn long_running_recognize(
        &self,
        audio_uri: &str,
        config: &BatchConfig,
    ) -> Result<Vec<RecognitionResult>>;
}
