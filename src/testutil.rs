//! テスト用のコラボレータ実装

use crate::config::Config;
use crate::external::{CallControl, RecordingStorage};
use crate::health_check::HealthCheckScheduler;
use crate::notify::{Event, EventSink, NotifyHandler};
use crate::registry::SessionRegistry;
use crate::store::MemoryStore;
use crate::transcribe::{Dependencies, TranscribeHandler};
use crate::transcribe_backend::{
    AudioEncoding, BatchConfig, BatchRecognizer, RecognitionResult, StreamRequest, StreamResponse,
    StreamingProvider,
};
use crate::types::{
    CallInfo, CallStatus, ConfbridgeInfo, ExternalMedia, ExternalMediaRequest, RecordingInfo,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// 条件が満たされるまで最大2秒待つ
pub(crate) async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// 配信されたイベントを記録する
#[derive(Default)]
pub(crate) struct CapturingSink {
    events: Mutex<Vec<Event>>,
    fail: bool,
    gate: Option<watch::Sender<bool>>,
}

impl CapturingSink {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// `unblock` されるまで配信を止める
    pub(crate) fn blocked() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    pub(crate) fn unblock(&self) {
        if let Some(gate) = &self.gate {
            gate.send_replace(true);
        }
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub(crate) fn first(&self, event_type: &str) -> Option<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.event_type == event_type)
            .cloned()
    }
}

#[async_trait]
impl EventSink for CapturingSink {
    async fn deliver(&self, event: &Event) -> Result<()> {
        if let Some(gate) = &self.gate {
            let mut rx = gate.subscribe();
            let _ = rx.wait_for(|open| *open).await;
        }
        if self.fail {
            anyhow::bail!("配信先がダウンしています");
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct CallState {
    status: CallStatus,
    call_deleted: bool,
    get_call_fails: bool,
    confbridge_deleted: bool,
    /// この件数の作成に成功したあとは失敗する
    external_media_fail_after: Option<usize>,
    requests: Vec<ExternalMediaRequest>,
}

/// どの通話IDにも同じ状態を返す通話制御
pub(crate) struct MockCallControl {
    state: Mutex<CallState>,
}

impl MockCallControl {
    pub(crate) fn with_call(status: CallStatus) -> Self {
        Self {
            state: Mutex::new(CallState {
                status,
                call_deleted: false,
                get_call_fails: false,
                confbridge_deleted: false,
                external_media_fail_after: None,
                requests: Vec::new(),
            }),
        }
    }

    pub(crate) fn set_call_status(&self, status: CallStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub(crate) fn set_call_deleted(&self, deleted: bool) {
        self.state.lock().unwrap().call_deleted = deleted;
    }

    pub(crate) fn fail_get_call(&self) {
        self.state.lock().unwrap().get_call_fails = true;
    }

    pub(crate) fn set_confbridge_deleted(&self, deleted: bool) {
        self.state.lock().unwrap().confbridge_deleted = deleted;
    }

    pub(crate) fn fail_external_media(&self) {
        self.fail_external_media_after(0);
    }

    pub(crate) fn fail_external_media_after(&self, successes: usize) {
        self.state.lock().unwrap().external_media_fail_after = Some(successes);
    }

    pub(crate) fn external_media_requests(&self) -> Vec<ExternalMediaRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl CallControl for MockCallControl {
    async fn get_call(&self, call_id: Uuid) -> Result<CallInfo> {
        let state = self.state.lock().unwrap();
        if state.get_call_fails {
            anyhow::bail!("通話制御に接続できません");
        }
        Ok(CallInfo {
            id: call_id,
            status: state.status,
            deleted: state.call_deleted,
        })
    }

    async fn get_confbridge(&self, confbridge_id: Uuid) -> Result<ConfbridgeInfo> {
        let state = self.state.lock().unwrap();
        Ok(ConfbridgeInfo {
            id: confbridge_id,
            deleted: state.confbridge_deleted,
        })
    }

    async fn create_external_media(&self, request: &ExternalMediaRequest) -> Result<ExternalMedia> {
        let mut state = self.state.lock().unwrap();
        let created = state.requests.len();
        state.requests.push(request.clone());
        if state
            .external_media_fail_after
            .is_some_and(|successes| created >= successes)
        {
            anyhow::bail!("外部メディアを作成できません");
        }
        Ok(ExternalMedia {
            media_addr_ip: "10.0.0.1".to_string(),
            media_addr_port: 30000,
        })
    }
}

/// 登録した録音だけを返すストレージ
#[derive(Default)]
pub(crate) struct MockStorage {
    recordings: Mutex<HashMap<Uuid, RecordingInfo>>,
}

impl MockStorage {
    pub(crate) fn add_recording(&self, bucket_uri: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.recordings.lock().unwrap().insert(
            id,
            RecordingInfo {
                id,
                bucket_uri: bucket_uri.to_string(),
            },
        );
        id
    }
}

#[async_trait]
impl RecordingStorage for MockStorage {
    async fn get_recording(&self, recording_id: Uuid) -> Result<RecordingInfo> {
        self.recordings
            .lock()
            .unwrap()
            .get(&recording_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("録音が見つかりません: {}", recording_id))
    }
}

type Script = Vec<Result<StreamResponse>>;

/// ストリームごとに決められた応答を返すプロバイダ
///
/// 応答を送り終えたあとは送信側がクローズされるまで要求を記録し続ける。
pub(crate) struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Arc<Mutex<Vec<Vec<StreamRequest>>>>,
    closed: Arc<AtomicUsize>,
    fail_open: bool,
    linear16_only: bool,
    /// 送信側クローズ後、遅れて返す確定結果
    final_on_close: Option<(String, Duration)>,
}

impl ScriptedProvider {
    /// `scripts[i]` は i 番目に開かれたストリームの応答
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_open: false,
            linear16_only: false,
            final_on_close: None,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn linear16_only(scripts: Vec<Script>) -> Self {
        Self {
            linear16_only: true,
            ..Self::new(scripts)
        }
    }

    /// 送信側がクローズされてから `delay` 後に確定結果を1つ返す
    pub(crate) fn flushing_on_close(text: &str, delay: Duration) -> Self {
        Self {
            final_on_close: Some((text.to_string(), delay)),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn opened_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self, stream: usize) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .unwrap()
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StreamingProvider for ScriptedProvider {
    async fn open_stream(
        &self,
    ) -> Result<(mpsc::Sender<StreamRequest>, mpsc::Receiver<Result<StreamResponse>>)> {
        if self.fail_open {
            anyhow::bail!("認識サービスに接続できません");
        }

        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(Vec::new());
            requests.len() - 1
        };
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        let (request_tx, mut request_rx) = mpsc::channel::<StreamRequest>(64);
        let (response_tx, response_rx) = mpsc::channel(16);
        let requests = Arc::clone(&self.requests);
        let closed = Arc::clone(&self.closed);
        let final_on_close = self.final_on_close.clone();

        tokio::spawn(async move {
            for response in script {
                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
            while let Some(request) = request_rx.recv().await {
                requests.lock().unwrap()[index].push(request);
            }
            closed.fetch_add(1, Ordering::SeqCst);
            if let Some((text, delay)) = final_on_close {
                tokio::time::sleep(delay).await;
                let _ = response_tx
                    .send(Ok(StreamResponse {
                        results: vec![RecognitionResult::final_result(&text)],
                    }))
                    .await;
            }
            drop(response_tx);
        });

        Ok((request_tx, response_rx))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, encoding: AudioEncoding) -> bool {
        !self.linear16_only || encoding == AudioEncoding::Linear16
    }
}

/// 固定の認識結果を返すバッチ認識
pub(crate) struct ScriptedRecognizer {
    text: Option<String>,
    calls: Mutex<Vec<(String, BatchConfig)>>,
}

impl ScriptedRecognizer {
    pub(crate) fn returning(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            text: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, BatchConfig)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchRecognizer for ScriptedRecognizer {
    async fn long_running_recognize(
        &self,
        audio_uri: &str,
        config: &BatchConfig,
    ) -> Result<Vec<RecognitionResult>> {
        self.calls
            .lock()
            .unwrap()
            .push((audio_uri.to_string(), config.clone()));
        match &self.text {
            Some(text) => Ok(vec![RecognitionResult::final_result(text)]),
            None => anyhow::bail!("認識処理がタイムアウトしました"),
        }
    }
}

/// 予約されたヘルスチェックを記録するだけのスケジューラ
#[derive(Default)]
pub(crate) struct RecordingScheduler {
    scheduled: Mutex<Vec<(Uuid, Duration, u32)>>,
}

impl RecordingScheduler {
    pub(crate) fn scheduled(&self) -> Vec<(Uuid, Duration, u32)> {
        self.scheduled.lock().unwrap().clone()
    }

    pub(crate) fn last(&self) -> Option<(Uuid, Duration, u32)> {
        self.scheduled.lock().unwrap().last().copied()
    }
}

impl HealthCheckScheduler for RecordingScheduler {
    fn schedule(&self, transcribe_id: Uuid, delay: Duration, retry_count: u32) -> Result<()> {
        self.scheduled
            .lock()
            .unwrap()
            .push((transcribe_id, delay, retry_count));
        Ok(())
    }
}

/// `TranscribeHandler` とモック一式
pub(crate) struct Harness {
    pub(crate) handler: Arc<TranscribeHandler>,
    pub(crate) store: MemoryStore,
    pub(crate) call_control: Arc<MockCallControl>,
    pub(crate) storage: Arc<MockStorage>,
    pub(crate) provider: Arc<ScriptedProvider>,
    pub(crate) recognizer: Arc<ScriptedRecognizer>,
    pub(crate) scheduler: Arc<RecordingScheduler>,
    pub(crate) sink: Arc<CapturingSink>,
    pub(crate) notify: NotifyHandler,
    pub(crate) customer_id: Uuid,
    pub(crate) call_id: Uuid,
}

impl Harness {
    pub(crate) fn new(provider: ScriptedProvider) -> Self {
        Self::build(provider, ScriptedRecognizer::returning("ok"), None)
    }

    pub(crate) fn with_recognizer(provider: ScriptedProvider, recognizer: ScriptedRecognizer) -> Self {
        Self::build(provider, recognizer, None)
    }

    /// `scheduler` を実際に使い、`RecordingScheduler` には何も記録されない
    pub(crate) fn with_scheduler(
        provider: ScriptedProvider,
        scheduler: Arc<dyn HealthCheckScheduler>,
    ) -> Self {
        Self::build(provider, ScriptedRecognizer::returning("ok"), Some(scheduler))
    }

    fn build(
        provider: ScriptedProvider,
        recognizer: ScriptedRecognizer,
        scheduler_override: Option<Arc<dyn HealthCheckScheduler>>,
    ) -> Self {
        let mut config = Config::default();
        config.streaming.result_poll_interval_ms = 20;
        config.streaming.stop_grace_period_ms = 200;
        config.health_check.interval_ms = 10;

        let store = MemoryStore::new();
        let call_control = Arc::new(MockCallControl::with_call(CallStatus::Progressing));
        let storage = Arc::new(MockStorage::default());
        let provider = Arc::new(provider);
        let recognizer = Arc::new(recognizer);
        let scheduler = Arc::new(RecordingScheduler::default());
        let sink = Arc::new(CapturingSink::default());
        let notify = NotifyHandler::new(sink.clone(), 256);

        let active_scheduler: Arc<dyn HealthCheckScheduler> = match scheduler_override {
            Some(s) => s,
            None => scheduler.clone(),
        };

        let handler = TranscribeHandler::new(
            &config,
            Dependencies {
                transcribe_store: Arc::new(store.clone()),
                transcript_store: Arc::new(store.clone()),
                call_control: call_control.clone(),
                recording_storage: storage.clone(),
                streaming_provider: provider.clone(),
                batch_recognizer: recognizer.clone(),
                scheduler: active_scheduler,
                notify: notify.clone(),
                registry: SessionRegistry::new(),
            },
        );

        Self {
            handler: Arc::new(handler),
            store,
            call_control,
            storage,
            provider,
            recognizer,
            scheduler,
            sink,
            notify,
            customer_id: Uuid::new_v4(),
            call_id: Uuid::new_v4(),
        }
    }
}
