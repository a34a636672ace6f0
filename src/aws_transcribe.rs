use crate::config::AwsConfig;
use crate::g711;
use crate::transcribe_backend::{
    AudioEncoding, RecognitionResult, StreamConfig, StreamRequest, StreamResponse,
    StreamingProvider,
};
use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_transcribestreaming::types::{
    AudioEvent, AudioStream, LanguageCode, MediaEncoding, TranscriptResultStream,
};
use aws_sdk_transcribestreaming::Client as AwsTranscribeClient;
use aws_smithy_types::Blob;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// 送信バッファを強制的に吐き出すまでの待機時間
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Amazon Transcribe Streaming API プロバイダ
///
/// Transcribe にはリトルエンディアンの16ビットPCMを送る。μ-law (`ulaw`) の
/// ストリームは受信したバイトごとに展開してから送信する。
pub struct AwsStreamingProvider {
    config: AwsConfig,
}

impl AwsStreamingProvider {
    pub fn new(config: AwsConfig) -> Self {
        Self { config }
    }
}

/// RTPのビッグエンディアンPCMをリトルエンディアンへ並べ替える
fn to_little_endian(audio: &[u8]) -> Vec<u8> {
    audio
        .chunks_exact(2)
        .flat_map(|pair| [pair[1], pair[0]])
        .collect()
}

/// RTPペイロードを Transcribe に送るPCMへ変換
fn to_pcm(encoding: AudioEncoding, audio: &[u8]) -> Vec<u8> {
    match encoding {
        AudioEncoding::Linear16 => to_little_endian(audio),
        AudioEncoding::Mulaw => g711::mulaw_to_pcm_le(audio),
    }
}

fn language_code(tag: &str) -> LanguageCode {
    match tag {
        "ja-JP" => LanguageCode::JaJp,
        "en-US" => LanguageCode::EnUs,
        other => LanguageCode::from(other),
    }
}

#[async_trait]
impl StreamingProvider for AwsStreamingProvider {
    async fn open_stream(
        &self,
    ) -> Result<(mpsc::Sender<StreamRequest>, mpsc::Receiver<Result<StreamResponse>>)> {
        let (request_tx, mut request_rx) = mpsc::channel::<StreamRequest>(4096);
        let (response_tx, response_rx) = mpsc::channel::<Result<StreamResponse>>(32);

        // AWS SDKクライアント初期化
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.config.region.clone()))
            .load()
            .await;
        let client = AwsTranscribeClient::new(&sdk_config);
        let chunk_bytes = self.config.chunk_bytes;

        tokio::spawn(async move {
            // 最初のフレームは設定
            let stream_config: StreamConfig = match request_rx.recv().await {
                Some(StreamRequest::Config(config)) => config,
                Some(StreamRequest::Audio(_)) => {
                    let _ = response_tx
                        .send(Err(anyhow::anyhow!("設定フレームより先に音声を受信しました")))
                        .await;
                    return;
                }
                None => {
                    log::debug!("AwsStreamingProvider: 設定前にクローズされました");
                    return;
                }
            };

            let encoding = stream_config.encoding;
            log::debug!(
                "AwsStreamingProvider: ストリーム開始 ({:?}, {}Hz, {})",
                encoding,
                stream_config.sample_rate,
                stream_config.language
            );

            let input_stream = stream! {
                let mut pcm_buffer: Vec<u8> = Vec::new();

                loop {
                    match timeout(FLUSH_INTERVAL, request_rx.recv()).await {
                        Ok(Some(StreamRequest::Audio(audio))) => {
                            pcm_buffer.extend_from_slice(&to_pcm(encoding, &audio));

                            if pcm_buffer.len() >= chunk_bytes {
                                let chunk: Vec<u8> = pcm_buffer.drain(..chunk_bytes).collect();
                                yield Ok(AudioStream::AudioEvent(
                                    AudioEvent::builder().audio_chunk(Blob::new(chunk)).build(),
                                ));
                            }
                        }
                        Ok(Some(StreamRequest::Config(_))) => {
                            log::warn!("AwsStreamingProvider: 2回目の設定フレームを無視します");
                        }
                        Ok(None) => {
                            log::debug!("AwsStreamingProvider: 送信側クローズ");
                            if !pcm_buffer.is_empty() {
                                let chunk = pcm_buffer.split_off(0);
                                yield Ok(AudioStream::AudioEvent(
                                    AudioEvent::builder().audio_chunk(Blob::new(chunk)).build(),
                                ));
                            }
                            break;
                        }
                        Err(_) => {
                            // タイムアウトした場合、バッファに残っているデータを送信
                            if !pcm_buffer.is_empty() {
                                let chunk = pcm_buffer.split_off(0);
                                yield Ok(AudioStream::AudioEvent(
                                    AudioEvent::builder().audio_chunk(Blob::new(chunk)).build(),
                                ));
                            }
                        }
                    }
                }
            };

            let mut resp = match client
                .start_stream_transcription()
                .language_code(language_code(&stream_config.language))
                .media_sample_rate_hertz(stream_config.sample_rate as i32)
                .media_encoding(MediaEncoding::Pcm)
                .audio_stream(input_stream.into())
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    log::error!("Amazon Transcribe API開始失敗: {:?}", e);
                    let _ = response_tx
                        .send(Err(anyhow::anyhow!("Amazon Transcribe API開始失敗: {}", e)))
                        .await;
                    return;
                }
            };

            loop {
                match resp.transcript_result_stream.recv().await {
                    Ok(Some(TranscriptResultStream::TranscriptEvent(event))) => {
                        let results = event
                            .transcript
                            .and_then(|t| t.results)
                            .unwrap_or_default()
                            .into_iter()
                            .map(|result| RecognitionResult {
                                is_final: !result.is_partial,
                                alternatives: result
                                    .alternatives
                                    .unwrap_or_default()
                                    .into_iter()
                                    .map(|alt| alt.transcript.unwrap_or_default())
                                    .collect(),
                            })
                            .collect();

                        if response_tx.send(Ok(StreamResponse { results })).await.is_err() {
                            log::debug!("AwsStreamingProvider: 受信側がクローズされました");
                            break;
                        }
                    }
                    Ok(Some(other)) => {
                        log::debug!("Amazon Transcribe イベント: {:?}", other);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = response_tx
                            .send(Err(anyhow::anyhow!("Amazon Transcribe 受信エラー: {}", e)))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok((request_tx, response_rx))
    }

    fn name(&self) -> &'static str {
        "aws"
    }
}
