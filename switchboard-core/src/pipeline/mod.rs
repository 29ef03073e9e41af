//! Per-call audio pipeline.
//!
//! ## Stages
//!
//! ```text
//! listen:  socket → audio queue → 16 kHz f32 → endpointer → STT
//! respond: LLM token stream → sentence buffer → bounded queue
//!              └─► consumer task: TTS → 8 kHz band-passed PCM → paced sender
//! ```
//!
//! The producer/consumer split is the latency optimization that matters:
//! synthesis of sentence *k* overlaps generation of sentence *k+1*, which
//! cuts first-audio latency by roughly a third against a serial approach.
//!
//! A barge-in monitor runs beside every playback and aborts it on DTMF or
//! detected voice. Voice triggers commit their pre-trigger chunks to the
//! session's pre-roll, so the first word of the interruption is never lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{self, AudioBuffer, AudioProcessor};
use crate::config::Config;
use crate::error::{Result, SwitchboardError};
use crate::protocol::connection::Connection;
use crate::services::{
    voice_for, LanguageModel, SentenceBuffer, SpeechToText, TextToSpeech, TokenStream,
};
use crate::session::Session;
use crate::vad::{SpeechEvent, VadSessionState};

/// Sentences buffered between LLM production and TTS consumption.
const SENTENCE_QUEUE_CAP: usize = 5;
/// Queue read timeout while listening for an utterance.
const LISTEN_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Queue read timeout inside the barge-in monitor.
const BARGE_READ_TIMEOUT: Duration = Duration::from_millis(50);
/// Pacing lag beyond which we warn about congestion.
const LAG_WARN_SECS: f64 = 0.5;

/// How one playback run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackOutcome {
    Completed,
    Interrupted,
    Error,
}

/// Orchestrates listen → transcribe → generate → speak for one server.
#[derive(Clone)]
pub struct VoicePipeline {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    processor: Arc<AudioProcessor>,
    config: Arc<Config>,
}

impl VoicePipeline {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        config: Arc<Config>,
    ) -> Self {
        let processor = Arc::new(AudioProcessor::new(config.audio.clone()));
        Self {
            stt,
            llm,
            tts,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── Listening ───────────────────────────────────────────────────────

    /// Wait for one utterance and transcribe it.
    ///
    /// Returns `(None, None)` when silence timed out before any speech,
    /// `(Some(audio), None)` when speech was heard but the recognizer
    /// produced nothing, and `(Some(audio), Some(text))` on success.
    pub async fn listen_and_transcribe(
        &self,
        session: &Arc<Session>,
    ) -> Result<(Option<Vec<f32>>, Option<String>)> {
        let stt_rate = self.config.audio.stt_sample_rate;
        let mut buffer = AudioBuffer::new(stt_rate);
        let mut speech_started = false;

        session.reset_vad_state();

        // Barge-in pre-roll preserves the start of the interrupting
        // utterance.
        if let Some(pre_roll) = session.take_pre_roll() {
            debug!(
                call_id = %session.call_id(),
                chunks = pre_roll.len(),
                "pre-loading barge-in audio"
            );
            for chunk in pre_roll {
                buffer.add(chunk);
            }
            speech_started = true;
        }

        let max_samples =
            self.config.vad.max_utterance_seconds.max(1) as usize * stt_rate as usize;

        while session.is_active() && buffer.num_samples() < max_samples {
            if session.barge_in_requested() {
                break;
            }

            let Some(bytes) = session.connection().read_audio(LISTEN_READ_TIMEOUT).await else {
                if !speech_started {
                    return Ok((None, None));
                }
                break;
            };

            let samples = match self.processor.process_inbound(&bytes) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(call_id = %session.call_id(), "corrupt audio chunk: {e}");
                    continue;
                }
            };

            let result = session.process_vad_listening(&samples, stt_rate);
            match result.event {
                SpeechEvent::SpeechStart => {
                    debug!(call_id = %session.call_id(), "speech started");
                    speech_started = true;
                    buffer.add(samples);
                }
                SpeechEvent::Speech if speech_started => buffer.add(samples),
                SpeechEvent::SpeechEnd if speech_started => {
                    buffer.add(samples);
                    debug!(
                        call_id = %session.call_id(),
                        duration_ms = format_args!("{:.0}", buffer.duration_ms()),
                        "speech ended"
                    );
                    break;
                }
                _ => {}
            }
        }

        if buffer.is_empty() {
            return Ok((None, None));
        }

        let duration_ms = buffer.duration_ms();
        session.with_metrics(|m| {
            m.total_speech_duration_ms += duration_ms;
            m.stt_calls += 1;
        });

        let audio = buffer.into_samples();
        let result = self.stt.transcribe(&audio, stt_rate).await?;
        if result.is_empty() {
            debug!(call_id = %session.call_id(), "transcription empty");
            return Ok((Some(audio), None));
        }
        info!(
            call_id = %session.call_id(),
            text = %result.text,
            confidence = format_args!("{:.2}", result.confidence),
            "transcribed"
        );
        Ok((Some(audio), Some(result.text)))
    }

    // ── Speaking ────────────────────────────────────────────────────────

    /// Synthesize and play a fixed text (greetings, prompts).
    ///
    /// Returns `true` when playback ran to completion, `false` when
    /// interrupted or the connection died.
    pub async fn speak(&self, session: &Arc<Session>, text: &str) -> Result<bool> {
        if text.trim().is_empty() {
            return Ok(true);
        }

        let _speaking = self.begin_speaking(session);

        let voice = voice_for(
            &session.current_feature(),
            session.current_persona().as_deref(),
            &self.config.tts.voice,
        );
        session.with_metrics(|m| m.tts_calls += 1);
        let samples = self
            .tts
            .synthesize(text, &voice, self.config.tts.speed)
            .await?;
        if samples.is_empty() {
            return Ok(true);
        }

        let bytes = self
            .processor
            .process_outbound(&samples, self.tts.sample_rate())?;
        self.send_audio(session.connection(), &bytes, || {
            session.barge_in_requested() || !session.is_active()
        })
        .await
    }

    /// Generate a response for `transcript` and speak it with LLM/TTS
    /// overlap. Returns the assembled response text and whether playback
    /// ran to completion.
    pub async fn generate_and_speak_streaming(
        &self,
        session: &Arc<Session>,
        transcript: &str,
    ) -> Result<(String, bool)> {
        let stream_start = Instant::now();

        // The user turn is recorded before any token flows, so it survives
        // generation failures.
        let request_context = session.snapshot_context();
        session.add_user_message(transcript);
        session.with_metrics(|m| m.llm_calls += 1);

        let tokens = self
            .llm
            .generate_streaming(transcript, &request_context)
            .await?;

        let (full_text, completed) = self.speak_streaming(session, tokens).await?;

        let elapsed_ms = stream_start.elapsed().as_secs_f64() * 1_000.0;
        session.with_metrics(|m| m.first_sentence_latency_ms = Some(elapsed_ms));

        // Context gets the exact assembled text, whether or not it was
        // fully played.
        if !full_text.is_empty() {
            session.add_assistant_message(&full_text);
        }

        info!(
            call_id = %session.call_id(),
            elapsed_ms = format_args!("{:.0}", elapsed_ms),
            completed,
            preview = %full_text.chars().take(80).collect::<String>(),
            "streamed response"
        );
        Ok((full_text, completed))
    }

    /// Play a token stream sentence by sentence.
    pub async fn speak_streaming(
        &self,
        session: &Arc<Session>,
        mut tokens: TokenStream,
    ) -> Result<(String, bool)> {
        let _speaking = self.begin_speaking(session);

        let mut sentence_buffer = SentenceBuffer::new(
            self.config.tts.min_sentence_length,
            &self.config.tts.sentence_delimiters,
        );
        let (sentence_tx, sentence_rx) = mpsc::channel::<Option<String>>(SENTENCE_QUEUE_CAP);
        let consumer = tokio::spawn(
            self.clone()
                .sentence_consumer(Arc::clone(session), sentence_rx),
        );

        let mut collected = String::new();
        let mut interrupted = false;

        while let Some(token) = tokens.next_token().await {
            if session.barge_in_requested() {
                debug!(call_id = %session.call_id(), "streaming interrupted by barge-in");
                interrupted = true;
                break;
            }
            if consumer.is_finished() {
                break;
            }
            collected.push_str(&token);
            if let Some(sentence) = sentence_buffer.add_token(&token) {
                if sentence_tx.send(Some(sentence)).await.is_err() {
                    break;
                }
            }
        }

        if !interrupted {
            if let Some(residue) = sentence_buffer.flush() {
                let _ = sentence_tx.send(Some(residue)).await;
            }
        }
        let _ = sentence_tx.send(None).await;
        drop(sentence_tx);

        let outcome = consumer.await.unwrap_or(PlaybackOutcome::Error);

        // `tokens` drops here, closing the model stream promptly.
        Ok((
            collected,
            outcome == PlaybackOutcome::Completed && !interrupted,
        ))
    }

    async fn sentence_consumer(
        self,
        session: Arc<Session>,
        mut sentences: mpsc::Receiver<Option<String>>,
    ) -> PlaybackOutcome {
        loop {
            match sentences.recv().await {
                Some(Some(sentence)) => {
                    if session.barge_in_requested() {
                        return PlaybackOutcome::Interrupted;
                    }
                    match self.send_sentence(&session, &sentence).await {
                        Ok(true) => {}
                        Ok(false) => {
                            return if session.barge_in_requested() {
                                PlaybackOutcome::Interrupted
                            } else {
                                PlaybackOutcome::Error
                            };
                        }
                        Err(e) => {
                            warn!(call_id = %session.call_id(), "sentence playback failed: {e}");
                            return PlaybackOutcome::Error;
                        }
                    }
                }
                Some(None) | None => return PlaybackOutcome::Completed,
            }
        }
    }

    async fn send_sentence(&self, session: &Arc<Session>, sentence: &str) -> Result<bool> {
        if sentence.trim().is_empty() {
            return Ok(true);
        }
        let voice = voice_for(
            &session.current_feature(),
            session.current_persona().as_deref(),
            &self.config.tts.voice,
        );
        session.with_metrics(|m| m.tts_calls += 1);
        let samples = self
            .tts
            .synthesize(sentence, &voice, self.config.tts.speed)
            .await?;
        if samples.is_empty() {
            return Ok(true);
        }
        let bytes = self
            .processor
            .process_outbound(&samples, self.tts.sample_rate())?;
        self.send_audio(session.connection(), &bytes, || {
            session.barge_in_requested() || !session.is_active()
        })
        .await
    }

    /// Raise `is_speaking`, reset barge-in detection, and start the
    /// monitor. The guard lowers the flag and stops the monitor on drop,
    /// including cancellation.
    fn begin_speaking(&self, session: &Arc<Session>) -> SpeakingGuard {
        session.set_speaking(true);
        session.clear_pre_roll();
        session.reset_vad_state();
        let monitor = {
            let pipeline = self.clone();
            let session = Arc::clone(session);
            tokio::spawn(async move {
                pipeline.monitor_barge_in(session).await;
            })
        };
        SpeakingGuard {
            session: Arc::clone(session),
            monitor: Some(monitor),
        }
    }

    // ── Barge-in monitor ────────────────────────────────────────────────

    /// Watch for interruptions while audio plays.
    ///
    /// Any queued DTMF digit trips immediately. When voice barge-in is
    /// enabled, inbound audio runs through the session's endpointer with a
    /// dedicated state and a raised threshold to suppress echo/sidetone;
    /// chunks preceding SPEECH_START accumulate so the pre-roll preserves
    /// the first word.
    async fn monitor_barge_in(&self, session: Arc<Session>) {
        let voice_enabled = self.config.vad.barge_in_enabled && session.has_vad();
        let stt_rate = self.config.audio.stt_sample_rate;
        let mut barge_state = VadSessionState::default();
        let mut pending: Vec<Vec<f32>> = Vec::new();

        while session.is_speaking() && session.is_active() {
            if session.connection().has_dtmf() {
                debug!(call_id = %session.call_id(), "DTMF during playback, requesting barge-in");
                session.request_barge_in();
                break;
            }

            if voice_enabled {
                let Some(bytes) = session.connection().read_audio(BARGE_READ_TIMEOUT).await
                else {
                    continue;
                };
                let Ok(samples) = self.processor.process_inbound(&bytes) else {
                    continue;
                };
                let result = session.process_vad_chunk(
                    &samples,
                    stt_rate,
                    Some(self.config.vad.barge_in_threshold),
                    &mut barge_state,
                );
                match result.event {
                    SpeechEvent::SpeechStart => {
                        pending.push(samples);
                        session.set_pre_roll(std::mem::take(&mut pending));
                        session.request_barge_in();
                        debug!(call_id = %session.call_id(), "voice during playback, requesting barge-in");
                        break;
                    }
                    SpeechEvent::Silence => pending.clear(),
                    _ => pending.push(samples),
                }
            } else {
                tokio::time::sleep(BARGE_READ_TIMEOUT).await;
            }
        }
    }

    // ── Paced sender ────────────────────────────────────────────────────

    /// Write audio in real time: sleep to the cumulative schedule so slow
    /// socket writes shorten later sleeps instead of drifting. `should_stop`
    /// is evaluated before each chunk; returns `false` on stop or dead
    /// connection.
    pub async fn send_audio(
        &self,
        connection: &Arc<Connection>,
        audio: &[u8],
        mut should_stop: impl FnMut() -> bool,
    ) -> Result<bool> {
        let chunk_size = self.config.audio.chunk_size.max(2);
        let chunk_secs = chunk_size as f64 / (self.config.audio.output_sample_rate as f64 * 2.0);
        let start = Instant::now();
        let mut chunks_sent = 0usize;

        for chunk in audio::chunks(audio, chunk_size) {
            if should_stop() {
                return Ok(false);
            }
            if !connection.is_active() || connection.send_audio(chunk).await.is_err() {
                return Ok(false);
            }
            chunks_sent += 1;

            let expected = chunk_secs * chunks_sent as f64;
            let actual = start.elapsed().as_secs_f64();
            let delta = expected - actual;
            if delta > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delta)).await;
            } else if delta < -LAG_WARN_SECS {
                warn!(
                    lag_s = format_args!("{:.2}", -delta),
                    "audio send falling behind, network may be congested"
                );
            }
        }
        Ok(true)
    }

    // ── Sound effects ───────────────────────────────────────────────────

    /// Play a prerecorded WAV (SIT tones and friends) through the normal
    /// outbound path. Missing files degrade to a warning.
    pub async fn play_sound(&self, session: &Arc<Session>, name: &str) -> Result<bool> {
        let Some(dir) = self.config.audio.sounds_dir.as_ref() else {
            return Ok(false);
        };
        let path = dir.join(format!("{name}.wav"));
        if !path.exists() {
            warn!(path = %path.display(), "sound effect not found");
            return Ok(false);
        }

        let reader = hound::WavReader::open(&path)
            .map_err(|e| SwitchboardError::Audio(format!("sound {name}: {e}")))?;
        let spec = reader.spec();
        let mut samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .filter_map(std::result::Result::ok)
                .collect(),
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .filter_map(std::result::Result::ok)
                    .map(|s| s as f32 * scale)
                    .collect()
            }
        };
        if spec.channels == 2 {
            samples = samples
                .chunks(2)
                .map(|pair| (pair[0] + pair.get(1).copied().unwrap_or(0.0)) / 2.0)
                .collect();
        }

        let bytes = self.processor.process_outbound(&samples, spec.sample_rate)?;
        self.send_audio(session.connection(), &bytes, || !session.is_active())
            .await
    }
}

/// Clears `is_speaking` and stops the monitor on every exit path.
struct SpeakingGuard {
    session: Arc<Session>,
    monitor: Option<JoinHandle<()>>,
}

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        self.session.set_speaking(false);
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, MessageType};
    use crate::services::{StubLlm, StubStt, StubTts};
    use tokio::io::AsyncWriteExt;

    const CALL_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.tts.min_sentence_length = 8;
        config
    }

    fn pipeline_with(config: Config, tts: Arc<StubTts>) -> VoicePipeline {
        VoicePipeline::new(
            Arc::new(StubStt::new("hello operator")),
            Arc::new(StubLlm::new("First sentence here. Second sentence there.")),
            tts,
            Arc::new(config),
        )
    }

    async fn test_session(config: Config) -> (Arc<Session>, tokio::io::DuplexStream) {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let frame = Frame::new(MessageType::Uuid, CALL_ID.as_bytes().to_vec());
        client.write_all(&frame.encode().unwrap()).await.unwrap();
        let connection =
            crate::protocol::connection::Connection::open(server, "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
        (
            Arc::new(Session::new(connection, Arc::new(config))),
            client,
        )
    }

    async fn drain_audio_frames(
        client: &mut tokio::io::DuplexStream,
        idle: Duration,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match tokio::time::timeout(idle, Frame::read(client)).await {
                Ok(Ok(Some(frame))) => frames.push(frame),
                _ => break,
            }
        }
        frames
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn speak_paces_outbound_audio() {
        let config = test_config();
        let tts = Arc::new(StubTts::new(24_000, 480)); // ~20 ms of output audio per char
        let pipeline = pipeline_with(config.clone(), Arc::clone(&tts));
        let (session, mut client) = test_session(config).await;

        let start = Instant::now();
        let completed = pipeline
            .speak(&session, "Hello caller.")
            .await
            .expect("speak");
        let elapsed = start.elapsed();
        assert!(completed);

        // 13 chars × 480 samples @24 kHz → ~2080 samples @8 kHz ≈ 13 chunks
        // of 20 ms: pacing should hold playback near real time.
        assert!(elapsed >= Duration::from_millis(150), "too fast: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "too slow: {elapsed:?}");

        let frames = drain_audio_frames(&mut client, Duration::from_millis(200)).await;
        let audio_frames: Vec<&Frame> = frames
            .iter()
            .filter(|f| f.kind == MessageType::Audio)
            .collect();
        assert!(audio_frames.len() >= 10, "got {} frames", audio_frames.len());
        assert!(audio_frames
            .iter()
            .all(|f| f.payload.len() <= config_chunk_size(&pipeline)));
        assert!(!session.is_speaking());
    }

    fn config_chunk_size(pipeline: &VoicePipeline) -> usize {
        pipeline.config().audio.chunk_size
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dtmf_aborts_playback_quickly() {
        let config = test_config();
        let tts = Arc::new(StubTts::new(24_000, 2_400)); // ~100 ms per char: long playback
        let pipeline = pipeline_with(config.clone(), Arc::clone(&tts));
        let (session, mut client) = test_session(config).await;

        let speak_task = {
            let pipeline = pipeline.clone();
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                pipeline
                    .speak(&session, "This greeting goes on for quite a while indeed.")
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        let dtmf = Frame::new(MessageType::Dtmf, vec![b'1']);
        client.write_all(&dtmf.encode().unwrap()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), speak_task)
            .await
            .expect("speak should abort promptly")
            .expect("join")
            .expect("speak");
        assert!(!result, "playback should report interruption");
        assert!(session.barge_in_requested());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streaming_overlap_plays_all_sentences_and_updates_context() {
        let config = test_config();
        let tts = Arc::new(StubTts::new(24_000, 60));
        let pipeline = pipeline_with(config.clone(), Arc::clone(&tts));
        let (session, mut client) = test_session(config).await;

        let (text, completed) = pipeline
            .generate_and_speak_streaming(&session, "tell me things")
            .await
            .expect("stream");

        assert!(completed);
        assert_eq!(text, "First sentence here. Second sentence there.");
        let spoken = tts.spoken();
        assert_eq!(spoken.len(), 2, "spoken: {spoken:?}");
        assert_eq!(spoken[0], "First sentence here.");
        assert_eq!(spoken[1], "Second sentence there.");

        // Context carries the user turn and the exact assembled reply.
        let context = session.snapshot_context();
        let roles: Vec<_> = context.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                crate::services::Role::System,
                crate::services::Role::User,
                crate::services::Role::Assistant
            ]
        );
        assert_eq!(context.messages()[2].content, text);

        let frames = drain_audio_frames(&mut client, Duration::from_millis(200)).await;
        assert!(frames.iter().any(|f| f.kind == MessageType::Audio));
        assert!(!session.is_speaking());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listen_times_out_to_nothing_without_speech() {
        let config = test_config();
        let tts = Arc::new(StubTts::new(24_000, 60));
        let pipeline = pipeline_with(config.clone(), Arc::clone(&tts));
        let (session, _client) = test_session(config).await;

        let (audio, transcript) = pipeline
            .listen_and_transcribe(&session)
            .await
            .expect("listen");
        assert!(audio.is_none());
        assert!(transcript.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn paced_sender_respects_stop_predicate() {
        let config = test_config();
        let tts = Arc::new(StubTts::new(24_000, 60));
        let pipeline = pipeline_with(config.clone(), tts);
        let (session, _client) = test_session(config).await;

        let audio = vec![0u8; 3200]; // ten chunks
        let mut calls = 0;
        let sent = pipeline
            .send_audio(session.connection(), &audio, || {
                calls += 1;
                calls > 3
            })
            .await
            .expect("send");
        assert!(!sent, "stop predicate should abort the send");
    }
}
