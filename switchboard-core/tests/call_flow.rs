//! End-to-end call scenarios: a real TCP connection against the server
//! with stub AI services behind it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use switchboard_core::audio;
use switchboard_core::config::Config;
use switchboard_core::protocol::{Frame, MessageType};
use switchboard_core::services::{LanguageModel, StubLlm, StubStt, StubTts, TextToSpeech};
use switchboard_core::vad::{Endpointer, EnergyVad, VadPool};
use switchboard_core::{AudioSocketServer, VoicePipeline};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const CALL_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

fn test_config() -> Config {
    let mut config = Config::default();
    config.audio.host = "127.0.0.1".into();
    config.audio.port = 0;
    config.vad.min_speech_duration_ms = 200;
    config.vad.min_silence_duration_ms = 400;
    config.timeouts.dtmf_inter_digit_secs = 0.4;
    config
}

struct TestServer {
    server: Arc<AudioSocketServer>,
    tts: Arc<StubTts>,
    addr: std::net::SocketAddr,
    runner: JoinHandle<switchboard_core::Result<()>>,
}

impl TestServer {
    async fn start(config: Config, llm: Arc<dyn LanguageModel>) -> Self {
        let config = Arc::new(config);
        // ~5 ms of 8 kHz output audio per character keeps playback short.
        let tts = Arc::new(StubTts::new(24_000, 120));
        let pipeline = VoicePipeline::new(
            Arc::new(StubStt::new("please tell me something fun")),
            llm,
            Arc::clone(&tts) as Arc<dyn TextToSpeech>,
            Arc::clone(&config),
        );
        let vad_config = config.vad.clone();
        let pool = Arc::new(VadPool::with_factory(3, move || {
            Endpointer::new(Box::new(EnergyVad::new()), vad_config.clone())
        }));
        let server = Arc::new(AudioSocketServer::new(Arc::clone(&config), pipeline, pool));
        let addr = server.bind().await.expect("bind");
        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };
        Self {
            server,
            tts,
            addr,
            runner,
        }
    }

    async fn connect(&self, extension: Option<&str>) -> TcpStream {
        let mut stream = TcpStream::connect(self.addr).await.expect("connect");
        let payload = match extension {
            Some(ext) => format!("{CALL_ID}/{ext}").into_bytes(),
            None => CALL_ID.as_bytes().to_vec(),
        };
        let frame = Frame::new(MessageType::Uuid, payload);
        stream
            .write_all(&frame.encode().expect("encode uuid"))
            .await
            .expect("send uuid");
        stream
    }

    /// Poll the TTS log until some synthesized text contains `needle`.
    async fn wait_for_spoken(&self, needle: &str, overall: Duration) -> bool {
        let deadline = Instant::now() + overall;
        while Instant::now() < deadline {
            if self.tts.spoken().iter().any(|t| t.contains(needle)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn stop(self) {
        self.server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(8), self.runner).await;
    }
}

/// One 20 ms frame of a 440 Hz tone at 8 kHz.
fn tone_frame(phase: &mut f32) -> Vec<u8> {
    let samples: Vec<i16> = (0..160)
        .map(|_| {
            *phase += 2.0 * std::f32::consts::PI * 440.0 / 8_000.0;
            (phase.sin() * 8_000.0) as i16
        })
        .collect();
    audio::i16_to_bytes(&samples)
}

async fn send_audio_frames(stream: &mut TcpStream, frames: usize, silent: bool) {
    let mut phase = 0.0f32;
    for _ in 0..frames {
        let payload = if silent {
            vec![0u8; 320]
        } else {
            tone_frame(&mut phase)
        };
        let frame = Frame::audio(payload);
        stream
            .write_all(&frame.encode().expect("encode audio"))
            .await
            .expect("send audio");
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

/// Read frames until the line stays quiet for `idle`, collecting AUDIO
/// frame count along the way.
async fn drain_until_quiet(stream: &mut TcpStream, idle: Duration, overall: Duration) -> usize {
    let deadline = Instant::now() + overall;
    let mut audio_frames = 0usize;
    while Instant::now() < deadline {
        match tokio::time::timeout(idle, Frame::read(stream)).await {
            Ok(Ok(Some(frame))) => {
                if frame.kind == MessageType::Audio {
                    audio_frames += 1;
                }
            }
            _ => break,
        }
    }
    audio_frames
}

/// Read until a HANGUP frame or clean close arrives.
async fn wait_for_call_end(stream: &mut TcpStream, overall: Duration) -> bool {
    let deadline = Instant::now() + overall;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, Frame::read(stream)).await {
            Ok(Ok(Some(frame))) if frame.kind == MessageType::Hangup => return true,
            Ok(Ok(Some(_))) => continue,
            Ok(Ok(None)) => return true,
            Ok(Err(_)) => return true,
            Err(_) => return false,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_speech_turn_gets_spoken_response() {
    let harness = TestServer::start(
        test_config(),
        Arc::new(StubLlm::new(
            "Here is a classic for you. Two antennas met on a roof and got married.",
        )),
    )
    .await;
    let mut stream = harness.connect(None).await;

    // Greeting synthesized, then played out.
    assert!(
        harness
            .wait_for_spoken("your operator", Duration::from_secs(5))
            .await,
        "default greeting never played"
    );
    let greeting_frames = drain_until_quiet(
        &mut stream,
        Duration::from_millis(400),
        Duration::from_secs(10),
    )
    .await;
    assert!(greeting_frames > 0, "no greeting audio on the wire");

    // ~800 ms of tone, then over a second of silence to end the utterance.
    send_audio_frames(&mut stream, 40, false).await;
    send_audio_frames(&mut stream, 70, true).await;

    assert!(
        harness
            .wait_for_spoken("classic for you", Duration::from_secs(10))
            .await,
        "LLM response never reached the synthesizer"
    );
    let response_frames = drain_until_quiet(
        &mut stream,
        Duration::from_millis(400),
        Duration::from_secs(10),
    )
    .await;
    assert!(response_frames > 0, "no response audio on the wire");

    let hangup = Frame::hangup().encode().expect("encode");
    let _ = stream.write_all(&hangup).await;
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_dial_extension_plays_feature_greeting() {
    let harness = TestServer::start(test_config(), Arc::new(StubLlm::new("Sure thing."))).await;
    let mut stream = harness.connect(Some("555-5653")).await;

    assert!(
        harness
            .wait_for_spoken("Dial-A-Joke", Duration::from_secs(5))
            .await,
        "direct dial greeting missing"
    );
    // The operator greeting must not have played first.
    assert!(
        !harness.tts.spoken().iter().any(|t| t.contains("your operator")),
        "operator greeting played despite direct dial"
    );

    let frames = drain_until_quiet(
        &mut stream,
        Duration::from_millis(400),
        Duration::from_secs(10),
    )
    .await;
    assert!(frames > 0);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_direct_dial_plays_intercept_then_hangs_up() {
    let harness = TestServer::start(test_config(), Arc::new(StubLlm::new("unused"))).await;
    let mut stream = harness.connect(Some("555-9999")).await;

    assert!(
        harness
            .wait_for_spoken("not in service", Duration::from_secs(5))
            .await,
        "intercept message missing"
    );
    assert!(
        wait_for_call_end(&mut stream, Duration::from_secs(5)).await,
        "server did not hang up after the intercept"
    );
    // The message plays exactly once.
    let intercepts = harness
        .tts
        .spoken()
        .iter()
        .filter(|t| t.contains("not in service"))
        .count();
    assert_eq!(intercepts, 1);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dtmf_during_greeting_barges_in_and_routes() {
    let harness = TestServer::start(test_config(), Arc::new(StubLlm::new("Sure thing."))).await;
    let mut stream = harness.connect(None).await;

    // Interrupt the greeting with a single-key shortcut.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let dtmf = Frame::new(MessageType::Dtmf, vec![b'1']);
    stream
        .write_all(&dtmf.encode().expect("encode dtmf"))
        .await
        .expect("send dtmf");

    // After the inter-digit gap the buffered digit routes to Dial-A-Joke.
    assert!(
        harness
            .wait_for_spoken("Dial-A-Joke", Duration::from_secs(8))
            .await,
        "shortcut never routed after barge-in"
    );
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silence_prompts_then_says_goodbye_and_hangs_up() {
    let mut config = test_config();
    config.timeouts.silence_prompt_secs = 1.5;
    config.timeouts.silence_goodbye_secs = 1.5;
    let harness = TestServer::start(config, Arc::new(StubLlm::new("unused"))).await;
    let mut stream = harness.connect(None).await;

    assert!(
        harness
            .wait_for_spoken("still there", Duration::from_secs(10))
            .await,
        "silence prompt missing"
    );
    assert!(
        harness
            .wait_for_spoken("Thanks for calling", Duration::from_secs(10))
            .await,
        "goodbye message missing"
    );
    assert!(
        wait_for_call_end(&mut stream, Duration::from_secs(10)).await,
        "server did not hang up after goodbye"
    );
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn llm_first_token_timeout_apologizes_without_ending_call() {
    // A backend that accepts connections and never answers.
    let black_hole = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind black hole");
    let black_hole_addr = black_hole.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = black_hole.accept().await {
            held.push(socket);
        }
    });

    let mut config = test_config();
    config.llm.endpoint = format!("http://{black_hole_addr}");
    config.llm.first_token_timeout_secs = 1;
    let llm = Arc::new(switchboard_core::services::OllamaClient::new(
        config.llm.clone(),
    ));
    let harness = TestServer::start(config, llm).await;
    let mut stream = harness.connect(None).await;

    assert!(
        harness
            .wait_for_spoken("your operator", Duration::from_secs(5))
            .await
    );
    drain_until_quiet(
        &mut stream,
        Duration::from_millis(400),
        Duration::from_secs(10),
    )
    .await;

    // A normal turn whose generation stalls.
    send_audio_frames(&mut stream, 40, false).await;
    send_audio_frames(&mut stream, 70, true).await;

    assert!(
        harness
            .wait_for_spoken("taking too long", Duration::from_secs(10))
            .await,
        "apology never spoken"
    );
    // The call survives the timeout and keeps listening.
    assert!(
        !wait_for_call_end(&mut stream, Duration::from_secs(2)).await,
        "call ended after a recoverable LLM timeout"
    );
    harness.stop().await;
}
