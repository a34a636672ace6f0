use crate::transcribe_backend::AudioEncoding;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// このホストの識別子（Transcribeに記録するのみ）
    #[serde(default = "default_host_id")]
    pub host_id: Uuid,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub aws: AwsConfig,
    pub whisper: Option<WhisperConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// ストリーミングセッション設定
///
/// RTP受信ソケットと外部メディアブリッジ、認識ストリームに関する設定。
///
/// # デフォルト値
///
/// - `listen_address`: "127.0.0.1"
/// - `port_min` / `port_max`: 10000 / 20000
/// - `max_port_attempts`: 10 回
/// - `external_media_format`: "ulaw"
/// - `sample_rate`: 8000 Hz
/// - `channels`: 1
/// - `audio_channel_capacity`: 4096
/// - `result_poll_interval_ms`: 400 ms
/// - `speech_events`: true
/// - `stop_grace_period_ms`: 5000 ms
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u32,
    #[serde(default = "default_external_media_format")]
    pub external_media_format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_audio_channel_capacity")]
    pub audio_channel_capacity: usize,
    #[serde(default = "default_result_poll_interval_ms")]
    pub result_poll_interval_ms: u64,
    /// 中間結果から発話イベントを発行するか
    #[serde(default = "default_speech_events")]
    pub speech_events: bool,
    /// 停止後、認識サービスの残りの結果を待つ上限
    #[serde(default = "default_stop_grace_period_ms")]
    pub stop_grace_period_ms: u64,
}

/// Amazon Transcribe 設定
///
/// # デフォルト値
///
/// - `region`: "ap-northeast-1"
/// - `chunk_bytes`: 3200 (8kHz/16bit で 200ms)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AwsConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
}

/// 録音ファイルのバッチ文字起こし設定（OpenAI互換API）
///
/// `Debug` 出力では `api_key` を伏せる。
#[derive(Clone, Deserialize, Serialize)]
pub struct WhisperConfig {
    pub api_key: String,
    #[serde(default = "default_whisper_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_whisper_model")]
    pub model: String,
    #[serde(default = "default_whisper_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// ヘルスチェック設定
///
/// # デフォルト値
///
/// - `interval_ms`: 5000 ms
/// - `max_retry`: 2 回（これを超えると強制停止）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_check_max_retry")]
    pub max_retry: u32,
}

/// 通知キュー設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// 出力設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default functions
fn default_host_id() -> Uuid {
    Uuid::nil()
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port_min() -> u16 {
    10000
}

fn default_port_max() -> u16 {
    20000
}

fn default_max_port_attempts() -> u32 {
    10
}

fn default_external_media_format() -> String {
    "ulaw".to_string()
}

fn default_sample_rate() -> u32 {
    8000
}

fn default_channels() -> u16 {
    1
}

fn default_audio_channel_capacity() -> usize {
    4096
}

fn default_result_poll_interval_ms() -> u64 {
    400
}

fn default_speech_events() -> bool {
    true
}

fn default_stop_grace_period_ms() -> u64 {
    5000
}

fn default_region() -> String {
    "ap-northeast-1".to_string()
}

fn default_chunk_bytes() -> usize {
    3200
}

fn default_whisper_endpoint() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_string()
}

fn default_whisper_model() -> String {
    "whisper-1".to_string()
}

fn default_whisper_timeout_seconds() -> u64 {
    300
}

fn default_health_check_interval_ms() -> u64 {
    5000
}

fn default_health_check_max_retry() -> u32 {
    2
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_id: default_host_id(),
            streaming: StreamingConfig::default(),
            aws: AwsConfig::default(),
            whisper: None,
            health_check: HealthCheckConfig::default(),
            notify: NotifyConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl fmt::Debug for WhisperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhisperConfig")
            .field("api_key", &"***")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            max_port_attempts: default_max_port_attempts(),
            external_media_format: default_external_media_format(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            audio_channel_capacity: default_audio_channel_capacity(),
            result_poll_interval_ms: default_result_poll_interval_ms(),
            speech_events: default_speech_events(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            chunk_bytes: default_chunk_bytes(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_check_interval_ms(),
            max_retry: default_health_check_max_retry(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl StreamingConfig {
    /// 外部メディアのフォーマットに対応する音声エンコーディング
    pub fn encoding(&self) -> Result<AudioEncoding> {
        AudioEncoding::from_media_format(&self.external_media_format).with_context(|| {
            format!(
                "未対応の外部メディアフォーマット: {}",
                self.external_media_format
            )
        })
    }

    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use call_transcribe::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }

    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<()> {
        let streaming = &self.streaming;
        if streaming.port_min == 0 || streaming.port_min > streaming.port_max {
            anyhow::bail!(
                "ポート範囲が不正です: {}-{}",
                streaming.port_min,
                streaming.port_max
            );
        }
        if streaming.max_port_attempts == 0 {
            anyhow::bail!("max_port_attempts は1以上にしてください");
        }
        if streaming.audio_channel_capacity == 0 {
            anyhow::bail!("audio_channel_capacity は1以上にしてください");
        }
        streaming.encoding()?;
        streaming
            .listen_address
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("listen_address が不正です: {}", streaming.listen_address))?;

        if self.notify.queue_capacity == 0 {
            anyhow::bail!("notify.queue_capacity は1以上にしてください");
        }
        if self.aws.chunk_bytes == 0 {
            anyhow::bail!("aws.chunk_bytes は1以上にしてください");
        }
        Ok(())
    }
}
