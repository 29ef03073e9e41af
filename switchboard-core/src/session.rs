//! Per-call session state.
//!
//! One `Session` exists per connection after the UUID handshake. It is
//! shared (via `Arc`) between the conversation loop, the barge-in
//! monitor, and the streaming playback tasks, so every field uses
//! interior mutability. No lock is held across an await.
//!
//! Invariant: `barge_in_requested` is only raised while `is_speaking`
//! and only inspected during playback; clearing it accompanies the
//! transition back to listening.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::prompts;
use crate::protocol::connection::Connection;
use crate::services::ConversationContext;
use crate::vad::{PooledVad, SpeechEvent, VadResult, VadSessionState};

/// Digits a telephone keypad can produce.
const VALID_DTMF: &str = "0123456789*#ABCD";
/// Accumulator cap; the oldest digit is dropped beyond this.
const MAX_DTMF_BUFFER: usize = 32;

/// Monotonically increasing per-call counters, finalized on hangup.
/// Metrics never block call progress.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_speech_duration_ms: f64,
    pub stt_calls: u32,
    pub llm_calls: u32,
    pub tts_calls: u32,
    pub dtmf_digits: u32,
    pub features_used: Vec<String>,
    pub first_sentence_latency_ms: Option<f64>,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            total_speech_duration_ms: 0.0,
            stt_calls: 0,
            llm_calls: 0,
            tts_calls: 0,
            dtmf_digits: 0,
            features_used: Vec::new(),
            first_sentence_latency_ms: None,
        }
    }
}

impl SessionMetrics {
    pub fn duration_seconds(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1_000.0
    }

    pub fn add_feature(&mut self, feature: &str) {
        if !self.features_used.iter().any(|f| f == feature) {
            self.features_used.push(feature.to_string());
        }
    }
}

#[derive(Debug, Default)]
struct DtmfState {
    buffer: String,
    last_digit: Option<Instant>,
}

/// All state for one active call.
pub struct Session {
    connection: Arc<Connection>,
    config: Arc<Config>,
    started: Instant,
    active: AtomicBool,
    speaking: AtomicBool,
    barge_in: AtomicBool,
    current_feature: Mutex<String>,
    current_persona: Mutex<Option<String>>,
    context: Mutex<ConversationContext>,
    metrics: Mutex<SessionMetrics>,
    dtmf: Mutex<DtmfState>,
    /// Endpointer borrowed from the pool for the duration of the call.
    vad: Mutex<Option<PooledVad>>,
    /// Endpointing counters for the listening loop.
    vad_state: Mutex<VadSessionState>,
    /// Chunks captured by the barge-in monitor just before SPEECH_START.
    pre_roll: Mutex<Option<Vec<Vec<f32>>>>,
}

impl Session {
    pub fn new(connection: Arc<Connection>, config: Arc<Config>) -> Self {
        let feature = "operator".to_string();
        let context = ConversationContext::with_system_prompt(
            prompts::system_prompt(&feature, None),
            config.max_history,
        );
        Self {
            connection,
            config,
            started: Instant::now(),
            active: AtomicBool::new(true),
            speaking: AtomicBool::new(false),
            barge_in: AtomicBool::new(false),
            current_feature: Mutex::new(feature),
            current_persona: Mutex::new(None),
            context: Mutex::new(context),
            metrics: Mutex::new(SessionMetrics::default()),
            dtmf: Mutex::new(DtmfState::default()),
            vad: Mutex::new(None),
            vad_state: Mutex::new(VadSessionState::default()),
            pre_roll: Mutex::new(None),
        }
    }

    pub fn call_id(&self) -> &str {
        self.connection.call_id()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.connection.is_active()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub async fn send_audio(&self, audio: &[u8]) -> Result<()> {
        self.connection.send_audio(audio).await
    }

    /// End the call: finalize metrics, notify the peer, close the socket.
    pub async fn hangup(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            {
                let mut metrics = self.metrics.lock();
                metrics.end_time = Some(Utc::now());
            }
            self.connection.send_hangup().await;
            self.connection.close().await;
            let metrics = self.metrics_snapshot();
            info!(
                call_id = %self.call_id(),
                duration_s = format_args!("{:.1}", metrics.duration_seconds()),
                stt_calls = metrics.stt_calls,
                llm_calls = metrics.llm_calls,
                tts_calls = metrics.tts_calls,
                features = ?metrics.features_used,
                "session finished"
            );
        }
    }

    // ── Speaking / barge-in flags ───────────────────────────────────────

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::Release);
    }

    pub fn barge_in_requested(&self) -> bool {
        self.barge_in.load(Ordering::Acquire)
    }

    /// Raise the barge-in flag; meaningful only during playback.
    pub fn request_barge_in(&self) {
        if self.is_speaking() {
            self.barge_in.store(true, Ordering::Release);
            debug!(call_id = %self.call_id(), "barge-in requested");
        }
    }

    pub fn clear_barge_in(&self) {
        self.barge_in.store(false, Ordering::Release);
    }

    // ── DTMF accumulator ────────────────────────────────────────────────

    /// Add a digit to the accumulator.
    ///
    /// When the inter-digit gap has lapsed, the previously accumulated
    /// number is returned complete and the new digit starts a fresh
    /// buffer. Invalid digits are ignored; a full buffer drops its
    /// oldest digit.
    pub fn add_dtmf(&self, digit: char) -> Option<String> {
        if !VALID_DTMF.contains(digit) {
            warn!(call_id = %self.call_id(), ?digit, "invalid DTMF digit");
            return None;
        }
        self.metrics.lock().dtmf_digits += 1;

        let mut dtmf = self.dtmf.lock();
        let now = Instant::now();
        let gap = Duration::from_secs_f64(self.config.timeouts.dtmf_inter_digit_secs.max(0.0));

        if !dtmf.buffer.is_empty()
            && dtmf
                .last_digit
                .map(|t| now.duration_since(t) > gap)
                .unwrap_or(false)
        {
            let completed = std::mem::take(&mut dtmf.buffer);
            dtmf.buffer.push(digit);
            dtmf.last_digit = Some(now);
            return Some(completed);
        }

        if dtmf.buffer.len() >= MAX_DTMF_BUFFER {
            warn!(call_id = %self.call_id(), "DTMF buffer full, dropping oldest digit");
            dtmf.buffer.remove(0);
        }
        dtmf.buffer.push(digit);
        dtmf.last_digit = Some(now);
        None
    }

    /// Return the accumulated number once the inter-digit gap has lapsed
    /// with no further input.
    pub fn flush_stale_dtmf(&self) -> Option<String> {
        let mut dtmf = self.dtmf.lock();
        let gap = Duration::from_secs_f64(self.config.timeouts.dtmf_inter_digit_secs.max(0.0));
        if !dtmf.buffer.is_empty()
            && dtmf
                .last_digit
                .map(|t| t.elapsed() > gap)
                .unwrap_or(false)
        {
            dtmf.last_digit = None;
            return Some(std::mem::take(&mut dtmf.buffer));
        }
        None
    }

    /// Take and clear the accumulator (the `#` finalizer).
    pub fn take_dtmf_buffer(&self) -> String {
        std::mem::take(&mut self.dtmf.lock().buffer)
    }

    pub fn dtmf_buffer(&self) -> String {
        self.dtmf.lock().buffer.clone()
    }

    // ── Feature / persona ───────────────────────────────────────────────

    pub fn current_feature(&self) -> String {
        self.current_feature.lock().clone()
    }

    pub fn current_persona(&self) -> Option<String> {
        self.current_persona.lock().clone()
    }

    pub fn switch_feature(&self, feature: &str) {
        *self.current_feature.lock() = feature.to_string();
        *self.current_persona.lock() = None;
        self.metrics.lock().add_feature(feature);
        self.context
            .lock()
            .set_system_prompt(prompts::system_prompt(feature, None));
        info!(call_id = %self.call_id(), feature, "switched feature");
    }

    pub fn switch_persona(&self, persona: &str) {
        *self.current_persona.lock() = Some(persona.to_string());
        self.metrics.lock().add_feature(&format!("persona_{persona}"));
        let feature = self.current_feature();
        self.context
            .lock()
            .set_system_prompt(prompts::system_prompt(&feature, Some(persona)));
        info!(call_id = %self.call_id(), persona, "switched persona");
    }

    // ── Conversation context ────────────────────────────────────────────

    pub fn snapshot_context(&self) -> ConversationContext {
        self.context.lock().clone()
    }

    pub fn add_user_message(&self, content: &str) {
        self.context.lock().add_user_message(content);
    }

    pub fn add_assistant_message(&self, content: &str) {
        self.context.lock().add_assistant_message(content);
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    pub fn with_metrics<R>(&self, f: impl FnOnce(&mut SessionMetrics) -> R) -> R {
        f(&mut self.metrics.lock())
    }

    pub fn metrics_snapshot(&self) -> SessionMetrics {
        self.metrics.lock().clone()
    }

    // ── VAD ─────────────────────────────────────────────────────────────

    pub fn install_vad(&self, endpointer: PooledVad) {
        *self.vad.lock() = Some(endpointer);
    }

    /// Drop the pooled endpointer, returning it to the pool.
    pub fn release_vad(&self) {
        *self.vad.lock() = None;
    }

    pub fn has_vad(&self) -> bool {
        self.vad.lock().is_some()
    }

    /// Run one chunk through the held endpointer against caller-owned
    /// state (the barge-in monitor keeps its own).
    pub fn process_vad_chunk(
        &self,
        samples: &[f32],
        sample_rate: u32,
        threshold_override: Option<f32>,
        state: &mut VadSessionState,
    ) -> VadResult {
        let mut guard = self.vad.lock();
        match guard.as_mut() {
            Some(endpointer) => run_inference(|| {
                endpointer.process_chunk(samples, sample_rate, state, threshold_override)
            }),
            None => VadResult {
                event: SpeechEvent::Silence,
                probability: 0.0,
            },
        }
    }

    /// Run one chunk against the session's listening state.
    pub fn process_vad_listening(&self, samples: &[f32], sample_rate: u32) -> VadResult {
        let mut state = self.vad_state.lock();
        let mut guard = self.vad.lock();
        match guard.as_mut() {
            Some(endpointer) => {
                run_inference(|| endpointer.process_chunk(samples, sample_rate, &mut state, None))
            }
            None => VadResult {
                event: SpeechEvent::Silence,
                probability: 0.0,
            },
        }
    }

    /// Reset endpointing for a fresh utterance.
    pub fn reset_vad_state(&self) {
        self.vad_state.lock().reset();
        if let Some(endpointer) = self.vad.lock().as_mut() {
            endpointer.reset();
        }
    }

    // ── Barge-in pre-roll ───────────────────────────────────────────────

    pub fn set_pre_roll(&self, chunks: Vec<Vec<f32>>) {
        *self.pre_roll.lock() = Some(chunks);
    }

    pub fn take_pre_roll(&self) -> Option<Vec<Vec<f32>>> {
        self.pre_roll.lock().take()
    }

    pub fn clear_pre_roll(&self) {
        *self.pre_roll.lock() = None;
    }
}

/// Model inference is CPU-bound; keep it off the async worker when the
/// runtime has dedicated blocking threads.
fn run_inference<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
