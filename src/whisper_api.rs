use crate::config::WhisperConfig;
use crate::g711::mulaw_to_linear;
use crate::transcribe_backend::{AudioEncoding, BatchConfig, BatchRecognizer, RecognitionResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::io::Cursor;

/// OpenAI Whisper API レスポンス
#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
}

/// OpenAI互換 Whisper API による録音ファイルのバッチ認識
pub struct WhisperRecognizer {
    config: WhisperConfig,
    client: reqwest::Client,
}

impl WhisperRecognizer {
    pub fn new(config: WhisperConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Whisper API HTTPクライアント作成失敗")?;

        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// 録音ファイルを取得
    async fn fetch_audio(&self, audio_uri: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(audio_uri)
            .send()
            .await
            .with_context(|| format!("録音ファイルの取得に失敗: {}", audio_uri))?;

        if !response.status().is_success() {
            anyhow::bail!("録音ファイルの取得に失敗: {} - {}", audio_uri, response.status());
        }

        let body = response.bytes().await.context("録音ファイルの読み込みに失敗")?;
        Ok(body.to_vec())
    }

    /// Whisper APIを呼び出して文字起こし
    async fn transcribe_audio(&self, wav_data: Vec<u8>, language: &str) -> Result<String> {
        let part = multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("language", whisper_language(language));

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .multipart(form)
            .send()
            .await
            .context("Whisper API リクエスト失敗")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Whisper API エラー: {} - {}", status, error_text);
        }

        let whisper_response: WhisperResponse = response
            .json::<WhisperResponse>()
            .await
            .context("Whisper API レスポンスパース失敗")?;

        Ok(whisper_response.text)
    }
}

/// BCP-47 タグから Whisper の言語指定 (ISO-639-1) を取り出す
fn whisper_language(tag: &str) -> String {
    tag.split('-').next().unwrap_or(tag).to_lowercase()
}

/// WAVでなければヘッダ無しPCMとみなしてWAVに包む
fn ensure_wav(audio: Vec<u8>, config: &BatchConfig) -> Result<Vec<u8>> {
    if audio.starts_with(b"RIFF") {
        return Ok(audio);
    }

    let samples: Vec<i16> = match config.encoding {
        AudioEncoding::Linear16 => audio
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
        AudioEncoding::Mulaw => audio.iter().map(|&b| mulaw_to_linear(b)).collect(),
    };
    pcm_to_wav(&samples, config.sample_rate)
}

/// PCMデータをWAVフォーマットに変換
fn pcm_to_wav(pcm_data: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).context("WAVライター作成失敗")?;

        for &sample in pcm_data {
            writer.write_sample(sample).context("WAV書き込み失敗")?;
        }

        writer.finalize().context("WAV finalize失敗")?;
    }

    Ok(cursor.into_inner())
}

#[async_trait]
impl BatchRecognizer for WhisperRecognizer {
    async fn long_running_recognize(
        &self,
        audio_uri: &str,
        config: &BatchConfig,
    ) -> Result<Vec<RecognitionResult>> {
        let audio = self.fetch_audio(audio_uri).await?;
        log::debug!("Whisper API: {} バイトの録音を取得 ({})", audio.len(), audio_uri);

        let wav_data = ensure_wav(audio, config)?;
        let text = self.transcribe_audio(wav_data, &config.language).await?;
        log::debug!("Whisper API: 文字起こし結果 - {}", text);

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        // Whisper APIは常に最終結果
        Ok(vec![RecognitionResult::final_result(text.trim())])
    }
}
