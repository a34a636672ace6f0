use anyhow::{Context, Result};
use call_transcribe::aws_transcribe::AwsStreamingProvider;
use call_transcribe::config::Config;
use call_transcribe::transcribe_backend::StreamingProvider;
use call_transcribe::whisper_api::WhisperRecognizer;
use env_logger::Env;

#[tokio::main]
async fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // 設定を読み込み
    let config = Config::load_or_default(config_path)?;

    // ロガーを初期化
    env_logger::Builder::from_env(Env::default().default_filter_or(config.output.log_level.as_str()))
        .format_timestamp_millis()
        .init();

    config
        .validate()
        .with_context(|| format!("設定が不正です: {}", config_path))?;

    log::info!("call-transcribe を起動します (host {})", config.host_id);
    log::info!("設定: {:?}", config);

    let provider = AwsStreamingProvider::new(config.aws.clone());
    let encoding = config.streaming.encoding()?;
    if !provider.supports(encoding) {
        anyhow::bail!(
            "{} は external_media_format = \"{}\" に対応していません",
            provider.name(),
            config.streaming.external_media_format
        );
    }
    log::info!(
        "ストリーミング認識: {} ({}, {:?}, ポート {}-{})",
        provider.name(),
        config.aws.region,
        encoding,
        config.streaming.port_min,
        config.streaming.port_max
    );

    // 起動時にHTTPクライアントまで作って設定を検証する
    let _recognizer = match &config.whisper {
        Some(whisper) => {
            let recognizer = WhisperRecognizer::new(whisper.clone())
                .context("録音の文字起こしを初期化できません")?;
            log::info!(
                "録音の文字起こし: {} ({})",
                recognizer.endpoint(),
                recognizer.model()
            );
            Some(recognizer)
        }
        None => {
            log::info!("録音の文字起こしは無効です ([whisper] 未設定)");
            None
        }
    };

    log::info!(
        "ヘルスチェック: {}ms 間隔, 最大リトライ {} 回",
        config.health_check.interval_ms,
        config.health_check.max_retry
    );

    Ok(())
}
