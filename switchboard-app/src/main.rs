//! Switchboard server entry point.
//!
//! Wires the engine to its collaborators: HTTP service clients where
//! endpoints are configured (stubs otherwise, so the wire path can be
//! exercised without backends), a VAD pool, and signal-driven shutdown.

mod settings;

use std::sync::Arc;

use anyhow::Context;
use switchboard_core::{
    services::{
        HttpSttClient, HttpTtsClient, LanguageModel, OllamaClient, SpeechToText, StubLlm, StubStt,
        StubTts, TextToSpeech,
    },
    AudioSocketServer, Config, Endpointer, EnergyVad, VadPool, VoicePipeline,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = settings::default_config_path();
    let config = Arc::new(settings::load_config(&config_path));
    info!(
        config = %config_path.display(),
        host = %config.audio.host,
        port = config.audio.port,
        "starting switchboard"
    );

    let stt = build_stt(&config);
    let llm = build_llm(&config).await;
    let tts = build_tts(&config);
    let vad_pool = build_vad_pool(&config);

    let pipeline = VoicePipeline::new(stt, llm, tts, Arc::clone(&config));
    let server = Arc::new(AudioSocketServer::new(
        Arc::clone(&config),
        pipeline,
        vad_pool,
    ));

    server.bind().await.context("binding listener")?;
    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    server.shutdown();
    runner.await.context("server task")?.context("server run")?;

    Ok(())
}

fn build_stt(config: &Arc<Config>) -> Arc<dyn SpeechToText> {
    if config.stt.endpoint.is_empty() {
        warn!("no STT endpoint configured, using the stub recognizer");
        Arc::new(StubStt::new("hello operator"))
    } else {
        Arc::new(HttpSttClient::new(config.stt.clone()))
    }
}

async fn build_llm(config: &Arc<Config>) -> Arc<dyn LanguageModel> {
    if config.llm.endpoint.is_empty() {
        warn!("no LLM endpoint configured, using the stub model");
        Arc::new(StubLlm::new(
            "I'm running without a language model right now, but the line works.",
        ))
    } else {
        let client = OllamaClient::new(config.llm.clone());
        match client.warm_up().await {
            Ok(()) => info!(model = %config.llm.model, "language model ready"),
            Err(e) => warn!("LLM warm-up failed ({e}), continuing cold"),
        }
        Arc::new(client)
    }
}

fn build_tts(config: &Arc<Config>) -> Arc<dyn TextToSpeech> {
    if config.tts.endpoint.is_empty() {
        warn!("no TTS endpoint configured, using the tone stub");
        // ~50 ms of audio per character approximates speech pacing.
        Arc::new(StubTts::new(config.tts.sample_rate, 1_200))
    } else {
        Arc::new(HttpTtsClient::new(config.tts.clone()))
    }
}

#[cfg(feature = "onnx")]
fn build_vad_pool(config: &Arc<Config>) -> Arc<VadPool> {
    use switchboard_core::SileroVad;

    let path = config
        .vad
        .model_path
        .clone()
        .unwrap_or_else(SileroVad::default_model_path);
    if path.exists() {
        let mut models = Vec::new();
        for _ in 0..config.vad.pool_size {
            // Each slot loads its own session so recurrent state stays
            // isolated per call.
            match SileroVad::new(&path) {
                Ok(model) => models.push(Endpointer::new(Box::new(model), config.vad.clone())),
                Err(e) => {
                    warn!("Silero VAD load failed ({e}), falling back to energy VAD");
                    models.clear();
                    break;
                }
            }
        }
        if !models.is_empty() {
            info!(path = %path.display(), pool = models.len(), "Silero VAD pool ready");
            return Arc::new(VadPool::new(models));
        }
    } else {
        warn!(path = %path.display(), "Silero VAD model not found, using energy VAD");
    }
    energy_pool(config)
}

#[cfg(not(feature = "onnx"))]
fn build_vad_pool(config: &Arc<Config>) -> Arc<VadPool> {
    energy_pool(config)
}

fn energy_pool(config: &Arc<Config>) -> Arc<VadPool> {
    let vad_config = config.vad.clone();
    Arc::new(VadPool::with_factory(config.vad.pool_size, move || {
        Endpointer::new(Box::new(EnergyVad::new()), vad_config.clone())
    }))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
