use crate::config::StreamingConfig;
use crate::error::{Result, TranscribeError};
use crate::external::CallControl;
use crate::notify::NotifyHandler;
use crate::registry::SessionRegistry;
use crate::rtp;
use crate::transcribe_backend::{StreamConfig, StreamRequest, StreamResponse, StreamingProvider};
use crate::transcript::TranscriptHandler;
use crate::types::{event_type, Direction, ExternalMediaRequest, SpeechEvent, Streaming};
use anyhow::Context;
use chrono::Utc;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use uuid::Uuid;

/// 稼働中のストリーミングセッション
///
/// UDPソケットと認識ストリームは起動したタスク群が所有し、
/// このハンドルは有効化と停止のシグナルだけを持つ。
/// 有効化されるまでは結果を処理せず、イベントも発行しない。
#[derive(Clone, Debug)]
pub struct StreamingSession {
    streaming: Streaming,
    shutdown_tx: Arc<watch::Sender<bool>>,
    activate_tx: Arc<watch::Sender<bool>>,
}

impl StreamingSession {
    pub fn id(&self) -> Uuid {
        self.streaming.id
    }

    pub fn streaming(&self) -> &Streaming {
        &self.streaming
    }

    pub fn direction(&self) -> Direction {
        self.streaming.direction
    }

    /// 停止が要求済み、または結果ループが終了済みか
    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// タスクに紐付かないセッション（レジストリのテスト用）
    #[cfg(test)]
    pub(crate) fn detached(streaming: Streaming) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (activate_tx, _) = watch::channel(false);
        Self {
            streaming,
            shutdown_tx: Arc::new(shutdown_tx),
            activate_tx: Arc::new(activate_tx),
        }
    }
}

/// ストリーミングセッションの開始・停止
///
/// 1セッションにつき、RTP受信・音声転送・結果処理の3タスクを起動する。
#[derive(Clone)]
pub struct StreamingHandler {
    config: StreamingConfig,
    provider: Arc<dyn StreamingProvider>,
    call_control: Arc<dyn CallControl>,
    transcript_handler: TranscriptHandler,
    notify: NotifyHandler,
    registry: SessionRegistry,
}

impl StreamingHandler {
    pub fn new(
        config: StreamingConfig,
        provider: Arc<dyn StreamingProvider>,
        call_control: Arc<dyn CallControl>,
        transcript_handler: TranscriptHandler,
        notify: NotifyHandler,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            config,
            provider,
            call_control,
            transcript_handler,
            notify,
            registry,
        }
    }

    /// 通話の片方向の音声についてストリーミング文字起こしを開始
    ///
    /// ポート確保・ストリーム開始・外部メディア作成のいずれかが失敗した場合は
    /// 何も残さずにエラーを返す。返したセッションは `activate` するまで
    /// `streaming_started` を発行しない。
    pub async fn start(
        &self,
        customer_id: Uuid,
        transcribe_id: Uuid,
        call_id: Uuid,
        language: &str,
        direction: Direction,
    ) -> Result<StreamingSession> {
        let encoding = self.config.encoding()?;
        if !self.provider.supports(encoding) {
            return Err(TranscribeError::UnsupportedEncoding {
                provider: self.provider.name(),
                encoding,
            });
        }

        let (socket, port) = self.bind_socket().await?;

        let (request_tx, response_rx) = self
            .provider
            .open_stream()
            .await
            .with_context(|| format!("{} ストリームの開始に失敗", self.provider.name()))?;

        let request = ExternalMediaRequest::new(
            call_id,
            format!("{}:{}", self.config.listen_address, port),
            self.config.external_media_format.clone(),
            direction,
        );
        let media = match self.call_control.create_external_media(&request).await {
            Ok(media) => media,
            Err(e) => {
                // 送信側を閉じてストリームを終了させる
                drop(request_tx);
                return Err(e
                    .context(format!("外部メディアの作成に失敗: call {}", call_id))
                    .into());
            }
        };

        let streaming = Streaming {
            id: Uuid::new_v4(),
            customer_id,
            transcribe_id,
            language: language.to_string(),
            direction,
        };
        log::info!(
            "ストリーミングを準備: {} (transcribe {}, {}, port {}, media {}:{})",
            streaming.id,
            transcribe_id,
            direction,
            port,
            media.media_addr_ip,
            media.media_addr_port
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (activate_tx, activate_rx) = watch::channel(false);
        let activate_tx = Arc::new(activate_tx);
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(self.config.audio_channel_capacity);

        tokio::spawn(rtp::run_ingest(socket, audio_tx, shutdown_rx.clone()));

        let stream_config = StreamConfig {
            encoding,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            language: language.to_string(),
            punctuation: true,
            interim_results: true,
        };
        tokio::spawn(forward_audio(
            streaming.id,
            stream_config,
            request_tx,
            audio_rx,
            shutdown_rx.clone(),
        ));

        tokio::spawn({
            let this = self.clone();
            let streaming = streaming.clone();
            let shutdown_tx = Arc::clone(&shutdown_tx);
            let started = Instant::now();
            async move {
                let activated = wait_activated(activate_rx, shutdown_rx.clone()).await;
                if activated {
                    log::info!(
                        "ストリーミングを開始: {} (transcribe {})",
                        streaming.id,
                        streaming.transcribe_id
                    );
                    this.publish_streaming(&streaming, event_type::STREAMING_STARTED);
                    this.process_results(&streaming, started, response_rx, shutdown_rx)
                        .await;
                } else {
                    log::debug!("ストリーミングは有効化前に破棄されました: {}", streaming.id);
                }

                // ソケットと送信側を閉じる
                shutdown_tx.send_replace(true);
                this.registry
                    .remove_session(streaming.transcribe_id, streaming.id);

                if activated {
                    log::info!(
                        "ストリーミングを終了: {} (transcribe {})",
                        streaming.id,
                        streaming.transcribe_id
                    );
                    this.publish_streaming(&streaming, event_type::STREAMING_STOPPED);
                }
            }
        });

        Ok(StreamingSession {
            streaming,
            shutdown_tx,
            activate_tx,
        })
    }

    /// レジストリ登録後にセッションを有効化
    ///
    /// ここで `streaming_started` が発行され、結果の処理が始まる。
    pub fn activate(&self, session: &StreamingSession) {
        session.activate_tx.send_replace(true);
    }

    /// セッションを停止
    ///
    /// ソケットと認識ストリームの送信側を閉じる。結果ループはストリームが閉じるか
    /// `stop_grace_period_ms` が過ぎるまで残りの結果を処理する。
    pub fn stop(&self, session: &StreamingSession) {
        let already_stopped = session.shutdown_tx.send_replace(true);
        if already_stopped {
            log::debug!("ストリーミングは既に停止しています: {}", session.id());
        } else {
            log::info!(
                "ストリーミングの停止を要求: {} (transcribe {})",
                session.id(),
                session.streaming.transcribe_id
            );
        }
    }

    /// 範囲内のランダムなポートでUDPソケットを確保
    async fn bind_socket(&self) -> Result<(UdpSocket, u16)> {
        let ip: IpAddr = self
            .config
            .listen_address
            .parse()
            .with_context(|| format!("listen_address が不正です: {}", self.config.listen_address))?;

        for attempt in 1..=self.config.max_port_attempts {
            let port = rand::thread_rng().gen_range(self.config.port_min..=self.config.port_max);
            match UdpSocket::bind(SocketAddr::new(ip, port)).await {
                Ok(socket) => return Ok((socket, port)),
                Err(e) => {
                    log::debug!("ポート {} を確保できません (試行 {}): {}", port, attempt, e);
                }
            }
        }

        log::warn!(
            "利用可能なポートがありません: {}-{} ({} 回試行)",
            self.config.port_min,
            self.config.port_max,
            self.config.max_port_attempts
        );
        Err(TranscribeError::NoAvailablePort)
    }

    /// 認識結果を受け取り、確定結果をTranscriptとして保存
    ///
    /// ストリームのエラー・クローズ、または保存失敗で終了する。
    /// 停止シグナルの後は猶予時間が過ぎた時点でも終了する。
    pub(crate) async fn process_results(
        &self,
        streaming: &Streaming,
        started: Instant,
        mut response_rx: mpsc::Receiver<anyhow::Result<StreamResponse>>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let poll_interval = self.config.result_poll_interval();
        let mut speaking = false;
        let mut drain_deadline: Option<Instant> = None;

        loop {
            if drain_deadline.is_none() && *shutdown_rx.borrow() {
                log::debug!("結果ループ: 停止シグナルを受信、残りの結果を待機 ({})", streaming.id);
                drain_deadline = Some(Instant::now() + self.config.stop_grace_period());
            }

            let wait = match drain_deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        log::warn!(
                            "結果ループ: 猶予時間内にストリームが閉じませんでした ({})",
                            streaming.id
                        );
                        break;
                    }
                    remaining.min(poll_interval)
                }
                None => poll_interval,
            };

            let response = match timeout(wait, response_rx.recv()).await {
                Err(_) => continue,
                Ok(None) => {
                    log::debug!("結果ループ: ストリームがクローズされました ({})", streaming.id);
                    break;
                }
                Ok(Some(Err(e))) => {
                    log::warn!("結果ループ: ストリームエラー ({}): {:?}", streaming.id, e);
                    break;
                }
                Ok(Some(Ok(response))) => response,
            };

            if let Err(e) = self
                .handle_response(streaming, started, &response, &mut speaking)
                .await
            {
                log::error!("結果ループ: Transcriptの保存に失敗 ({}): {}", streaming.id, e);
                break;
            }
        }
    }

    async fn handle_response(
        &self,
        streaming: &Streaming,
        started: Instant,
        response: &StreamResponse,
        speaking: &mut bool,
    ) -> Result<()> {
        for result in &response.results {
            if !result.is_final {
                if self.config.speech_events {
                    if !*speaking {
                        *speaking = true;
                        self.publish_speech(streaming, event_type::SPEECH_STARTED, None);
                    }
                    self.publish_speech(
                        streaming,
                        event_type::SPEECH_INTERIM,
                        Some(result.text().to_string()),
                    );
                }
                continue;
            }

            if *speaking {
                *speaking = false;
                self.publish_speech(streaming, event_type::SPEECH_ENDED, None);
            }

            let message = result.text().trim();
            if message.is_empty() {
                continue;
            }

            let tm_transcript_ms = started.elapsed().as_millis() as u64;
            let transcript = self
                .transcript_handler
                .create(
                    streaming.customer_id,
                    streaming.transcribe_id,
                    streaming.direction,
                    message,
                    tm_transcript_ms,
                )
                .await?;
            log::debug!(
                "確定結果 ({}, {}ms): {}",
                streaming.direction,
                tm_transcript_ms,
                transcript.message
            );
        }

        Ok(())
    }

    fn publish_streaming(&self, streaming: &Streaming, event: &str) {
        if let Err(e) = self
            .notify
            .publish_webhook_event(streaming.customer_id, event, streaming)
        {
            log::warn!("{} を発行できません: {}", event, e);
        }
    }

    fn publish_speech(&self, streaming: &Streaming, event: &str, message: Option<String>) {
        let payload = SpeechEvent {
            streaming_id: streaming.id,
            transcribe_id: streaming.transcribe_id,
            direction: streaming.direction,
            message,
            tm_event: Utc::now(),
        };
        if let Err(e) = self
            .notify
            .publish_webhook_event(streaming.customer_id, event, &payload)
        {
            log::warn!("{} を発行できません: {}", event, e);
        }
    }
}

/// セッションが有効化されるまで待つ
///
/// 先に停止された場合、またはハンドルが破棄された場合は false。
async fn wait_activated(
    mut activate_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> bool {
    loop {
        if *activate_rx.borrow_and_update() {
            return true;
        }
        if *shutdown_rx.borrow_and_update() {
            return false;
        }
        tokio::select! {
            changed = activate_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// 設定フレームを送ったあと、受信した音声を認識ストリームへ転送
///
/// 終了時に送信チャンネルをドロップし、ストリームの送信側を閉じる。
async fn forward_audio(
    streaming_id: Uuid,
    config: StreamConfig,
    request_tx: mpsc::Sender<StreamRequest>,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if request_tx.send(StreamRequest::Config(config)).await.is_err() {
        log::warn!("設定フレームを送信できません ({})", streaming_id);
        return;
    }

    let mut chunks: u64 = 0;
    loop {
        tokio::select! {
            chunk = audio_rx.recv() => match chunk {
                Some(audio) => {
                    if request_tx.send(StreamRequest::Audio(audio)).await.is_err() {
                        log::warn!("音声を送信できません ({})", streaming_id);
                        break;
                    }
                    chunks += 1;
                }
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    log::debug!("音声転送を終了 ({}): {} チャンク", streaming_id, chunks);
}
