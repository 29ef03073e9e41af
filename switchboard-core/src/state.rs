//! Conversation state machine.
//!
//! ## Flow
//!
//! ```text
//! IDLE ─► GREETING ─► MAIN_MENU ─► LISTENING ─► PROCESSING ─► SPEAKING
//!                        ▲            │  ▲                        │
//!   (menu return, `*`) ──┘            │  └── TIMEOUT ◄────────────┘
//!                                     ▼        (barge-in → BARGE_IN)
//!                                  GOODBYE ─► HANGUP
//! ```
//!
//! The operator greeting and every menu return pass through MAIN_MENU,
//! which drains any DTMF queued during playback before listening resumes.
//!
//! The machine is driven by the connection handler: `process()` is called
//! in a loop until the state reaches HANGUP or the session dies. Each call
//! handles exactly one state's work and performs its transitions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pipeline::VoicePipeline;
use crate::routing::{EntryType, PhoneRouter, RouteResult};
use crate::session::Session;

const DEFAULT_GREETING: &str = "Welcome to the switchboard! I'm your operator. You can talk to me naturally, \
     or dial a number for specific services. Press star at any time to return \
     to this menu. How can I help you today?";

const MENU_RETURN_PROMPT: &str = "Returning to the main menu. How can I help you?";

const STILL_THERE_PROMPT: &str =
    "Are you still there? Say something or press any key to continue.";

const GOODBYE_MESSAGE: &str = "Thanks for calling the switchboard! Have a great day. Goodbye!";

/// Name of the not-in-service tone triplet in the sounds directory.
const SIT_SOUND: &str = "sit-intercept";

/// Watchdog for a wedged SPEAKING state.
const SPEAKING_WATCHDOG: Duration = Duration::from_secs(5);

/// Conversation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for call setup.
    Idle,
    /// Playing the welcome message.
    Greeting,
    /// Awaiting input at the main menu.
    MainMenu,
    /// Recording user speech.
    Listening,
    /// STT → LLM processing.
    Processing,
    /// TTS playback.
    Speaking,
    /// User interrupted playback.
    BargeIn,
    /// Silence timeout prompt.
    Timeout,
    /// Playing the farewell message.
    Goodbye,
    /// Call ended.
    Hangup,
}

/// Drives one call's conversation.
pub struct StateMachine {
    session: Arc<Session>,
    router: PhoneRouter,
    state: State,
    entered_at: Instant,
    /// Dial-plan route to apply before the greeting, if any.
    route: Option<RouteResult>,
    silence_start: Option<Instant>,
    timeout_prompted: bool,
}

impl StateMachine {
    pub fn new(session: Arc<Session>, route: Option<RouteResult>) -> Self {
        Self {
            session,
            router: PhoneRouter::new(),
            state: State::Idle,
            entered_at: Instant::now(),
            route,
            silence_start: None,
            timeout_prompted: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn transition_to(&mut self, new_state: State, trigger: &str) {
        if new_state == self.state {
            return;
        }
        debug!(
            call_id = %self.session.call_id(),
            from = ?self.state,
            to = ?new_state,
            trigger,
            "state transition"
        );
        self.state = new_state;
        self.entered_at = Instant::now();

        if !matches!(new_state, State::Timeout | State::Listening) {
            self.silence_start = None;
            self.timeout_prompted = false;
        }
    }

    /// Pull the machine back to LISTENING after a recovered error.
    pub fn recover_to_listening(&mut self) {
        self.session.clear_barge_in();
        self.transition_to(State::Listening, "error_recovery");
    }

    /// Handle the current state once.
    pub async fn process(&mut self, pipeline: &VoicePipeline) -> Result<()> {
        match self.state {
            State::Idle => {
                self.transition_to(State::Greeting, "call_start");
                self.play_greeting(pipeline).await?;
            }
            State::Greeting => {
                self.transition_to(State::Listening, "greeting_complete");
            }
            State::MainMenu => {
                if let Some(digit) = self.pending_dtmf().await {
                    self.handle_dtmf(digit, pipeline).await?;
                } else {
                    self.transition_to(State::Listening, "awaiting_input");
                }
            }
            State::Listening => {
                self.handle_listening(pipeline).await?;
            }
            State::Processing => {
                // Turn processing happens inline from LISTENING; reaching
                // here means a handler bailed early.
                self.transition_to(State::Listening, "processing_fallthrough");
            }
            State::Speaking => {
                if self.entered_at.elapsed() >= SPEAKING_WATCHDOG {
                    warn!(call_id = %self.session.call_id(), "speaking watchdog fired");
                    self.transition_to(State::Listening, "speaking_watchdog");
                } else {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
            State::BargeIn => {
                self.session.clear_barge_in();
                self.transition_to(State::Listening, "barge_in_handled");
            }
            State::Timeout => {
                self.handle_timeout(pipeline).await?;
            }
            State::Goodbye => {
                self.transition_to(State::Speaking, "play_goodbye");
                pipeline.speak(&self.session, GOODBYE_MESSAGE).await?;
                self.transition_to(State::Hangup, "goodbye_complete");
            }
            State::Hangup => {
                self.session.hangup().await;
            }
        }
        Ok(())
    }

    // ── Greeting ────────────────────────────────────────────────────────

    async fn play_greeting(&mut self, pipeline: &VoicePipeline) -> Result<()> {
        if let Some(route) = self.route.take() {
            return self.apply_direct_dial(route, pipeline).await;
        }

        self.transition_to(State::Speaking, "play_greeting");
        pipeline.speak(&self.session, DEFAULT_GREETING).await?;
        self.after_playback_to(State::MainMenu, "greeting_complete");
        Ok(())
    }

    /// Apply the dial-plan route before any operator greeting plays.
    async fn apply_direct_dial(
        &mut self,
        route: RouteResult,
        pipeline: &VoicePipeline,
    ) -> Result<()> {
        info!(
            call_id = %self.session.call_id(),
            feature = %route.feature,
            entry_type = ?route.entry_type,
            "direct dial"
        );
        match route.entry_type {
            EntryType::Invalid => {
                // SIT tones, the intercept message, then a hard hangup.
                self.transition_to(State::Speaking, "invalid_number");
                let _ = pipeline.play_sound(&self.session, SIT_SOUND).await;
                if let Some(greeting) = &route.greeting {
                    pipeline.speak(&self.session, greeting).await?;
                }
                self.transition_to(State::Hangup, "invalid_direct_dial");
            }
            EntryType::Persona => {
                let persona = route.persona_key.as_deref().unwrap_or(&route.feature);
                self.session.switch_persona(persona);
                self.speak_routed_greeting(&route, pipeline).await?;
            }
            EntryType::Feature | EntryType::EasterEgg => {
                self.session.switch_feature(&route.feature);
                self.speak_routed_greeting(&route, pipeline).await?;
            }
        }
        Ok(())
    }

    async fn speak_routed_greeting(
        &mut self,
        route: &RouteResult,
        pipeline: &VoicePipeline,
    ) -> Result<()> {
        let greeting = route
            .greeting
            .clone()
            .unwrap_or_else(|| format!("Welcome to {}!", route.display_name));
        self.transition_to(State::Speaking, "routed_greeting");
        pipeline.speak(&self.session, &greeting).await?;
        self.after_playback("greeting_complete");
        Ok(())
    }

    // ── Listening ───────────────────────────────────────────────────────

    async fn handle_listening(&mut self, pipeline: &VoicePipeline) -> Result<()> {
        if self.silence_start.is_none() {
            self.silence_start = Some(Instant::now());
        }

        // A lapsed inter-digit gap finalizes the accumulated number.
        if let Some(number) = self.session.flush_stale_dtmf() {
            self.route_number(&number, pipeline).await?;
            return Ok(());
        }

        if let Some(digit) = self.pending_dtmf().await {
            self.handle_dtmf(digit, pipeline).await?;
            return Ok(());
        }

        let (_audio, transcript) = pipeline.listen_and_transcribe(&self.session).await?;

        match transcript {
            Some(text) if !text.trim().is_empty() => {
                self.silence_start = None;
                self.process_transcript(&text, pipeline).await?;
            }
            _ => {
                let elapsed = self
                    .silence_start
                    .map(|t| t.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                let prompt_after = self.session.config().timeouts.silence_prompt_secs;
                let goodbye_after = self.session.config().timeouts.silence_goodbye_secs;
                if self.timeout_prompted && elapsed >= goodbye_after {
                    self.transition_to(State::Goodbye, "extended_silence");
                } else if !self.timeout_prompted && elapsed >= prompt_after {
                    self.transition_to(State::Timeout, "silence_timeout");
                }
            }
        }
        Ok(())
    }

    async fn pending_dtmf(&self) -> Option<char> {
        if self.session.connection().has_dtmf() {
            self.session
                .connection()
                .read_dtmf(Duration::from_millis(100))
                .await
        } else {
            None
        }
    }

    // ── Turn processing ─────────────────────────────────────────────────

    async fn process_transcript(
        &mut self,
        transcript: &str,
        pipeline: &VoicePipeline,
    ) -> Result<()> {
        self.transition_to(State::Processing, "transcript_ready");
        let lowered = transcript.to_lowercase();

        if ["menu", "main menu", "go back"]
            .iter()
            .any(|phrase| lowered.contains(phrase))
        {
            self.session.switch_feature("operator");
            self.transition_to(State::Speaking, "menu_return");
            pipeline.speak(&self.session, MENU_RETURN_PROMPT).await?;
            self.after_playback_to(State::MainMenu, "menu_return_complete");
            return Ok(());
        }

        if ["goodbye", "hang up", "bye"]
            .iter()
            .any(|phrase| lowered.contains(phrase))
        {
            self.transition_to(State::Goodbye, "user_goodbye");
            return Ok(());
        }

        self.transition_to(State::Speaking, "response_ready");
        let (_text, _completed) = pipeline
            .generate_and_speak_streaming(&self.session, transcript)
            .await?;
        self.after_playback("response_complete");
        Ok(())
    }

    /// Route playback end through BARGE_IN when the monitor tripped.
    fn after_playback(&mut self, trigger: &str) {
        self.after_playback_to(State::Listening, trigger);
    }

    fn after_playback_to(&mut self, next: State, trigger: &str) {
        if self.session.barge_in_requested() {
            self.transition_to(State::BargeIn, "user_interrupt");
        } else {
            self.transition_to(next, trigger);
        }
    }

    // ── DTMF ────────────────────────────────────────────────────────────

    async fn handle_dtmf(&mut self, digit: char, pipeline: &VoicePipeline) -> Result<()> {
        debug!(call_id = %self.session.call_id(), digit = %digit, "handling DTMF");

        // Star always returns to the operator, regardless of routed feature.
        if digit == '*' {
            self.session.take_dtmf_buffer();
            self.session.switch_feature("operator");
            self.transition_to(State::Speaking, "star_to_operator");
            pipeline.speak(&self.session, MENU_RETURN_PROMPT).await?;
            self.after_playback_to(State::MainMenu, "menu_return_complete");
            return Ok(());
        }

        // Pound finalizes the accumulated number.
        if digit == '#' {
            let number = self.session.take_dtmf_buffer();
            if !number.is_empty() {
                self.route_number(&number, pipeline).await?;
            }
            return Ok(());
        }

        if let Some(completed) = self.session.add_dtmf(digit) {
            self.route_number(&completed, pipeline).await?;
        }
        Ok(())
    }

    async fn route_number(&mut self, number: &str, pipeline: &VoicePipeline) -> Result<()> {
        info!(call_id = %self.session.call_id(), number, "routing dialed number");
        let route = self.router.route_dtmf(number);

        match route.entry_type {
            EntryType::Invalid => {
                let greeting = route
                    .greeting
                    .unwrap_or_else(|| "That number is not in service.".to_string());
                self.transition_to(State::Speaking, "invalid_number");
                pipeline.speak(&self.session, &greeting).await?;
                self.after_playback("invalid_number_complete");
            }
            EntryType::Persona => {
                let persona = route.persona_key.as_deref().unwrap_or(&route.feature);
                self.session.switch_persona(persona);
                self.speak_routed_greeting(&route, pipeline).await?;
            }
            EntryType::Feature | EntryType::EasterEgg => {
                self.session.switch_feature(&route.feature);
                self.speak_routed_greeting(&route, pipeline).await?;
            }
        }
        Ok(())
    }

    // ── Timeout ─────────────────────────────────────────────────────────

    async fn handle_timeout(&mut self, pipeline: &VoicePipeline) -> Result<()> {
        // Continued silence after the prompt escalates to GOODBYE from the
        // listening handler, so this state only ever plays the prompt.
        self.timeout_prompted = true;
        pipeline.speak(&self.session, STILL_THERE_PROMPT).await?;
        self.silence_start = Some(Instant::now());
        self.transition_to(State::Listening, "timeout_prompt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::{connection::Connection, Frame, MessageType};
    use crate::services::{StubLlm, StubStt, StubTts};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    const CALL_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.timeouts.silence_prompt_secs = 0.3;
        config.timeouts.silence_goodbye_secs = 0.6;
        config.timeouts.dtmf_inter_digit_secs = 0.2;
        config
    }

    struct Harness {
        machine: StateMachine,
        pipeline: VoicePipeline,
        session: Arc<Session>,
        tts: Arc<StubTts>,
        client: tokio::io::DuplexStream,
    }

    async fn harness(config: Config, route: Option<RouteResult>) -> Harness {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let frame = Frame::new(MessageType::Uuid, CALL_ID.as_bytes().to_vec());
        client.write_all(&frame.encode().unwrap()).await.unwrap();
        let connection = Connection::open(server, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let config = Arc::new(config);
        let tts = Arc::new(StubTts::new(24_000, 8));
        let pipeline = VoicePipeline::new(
            Arc::new(StubStt::new("hello there")),
            Arc::new(StubLlm::new("A perfectly fine answer.")),
            Arc::clone(&tts) as Arc<dyn crate::services::TextToSpeech>,
            Arc::clone(&config),
        );
        let session = Arc::new(Session::new(connection, config));
        let machine = StateMachine::new(Arc::clone(&session), route);
        Harness {
            machine,
            pipeline,
            session,
            tts,
            client,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_plays_default_greeting_then_awaits_menu_input() {
        let mut h = harness(fast_config(), None).await;
        assert_eq!(h.machine.state(), State::Idle);
        h.machine.process(&h.pipeline).await.unwrap();
        assert_eq!(h.machine.state(), State::MainMenu);
        let spoken = h.tts.spoken();
        assert!(spoken[0].contains("your operator"), "{spoken:?}");

        // Nothing queued at the menu: fall through to listening.
        h.machine.process(&h.pipeline).await.unwrap();
        assert_eq!(h.machine.state(), State::Listening);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn main_menu_drains_queued_dtmf() {
        let mut h = harness(fast_config(), None).await;
        h.machine.process(&h.pipeline).await.unwrap(); // greeting
        assert_eq!(h.machine.state(), State::MainMenu);

        let dtmf = Frame::new(MessageType::Dtmf, vec![b'1']);
        h.client
            .write_all(&dtmf.encode().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.machine.process(&h.pipeline).await.unwrap();
        assert_eq!(h.session.dtmf_buffer(), "1", "menu should consume the queued digit");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn direct_dial_plays_routed_greeting_and_switches_feature() {
        let route = PhoneRouter::new().route("555-5653");
        let mut h = harness(fast_config(), Some(route)).await;
        h.machine.process(&h.pipeline).await.unwrap();
        assert_eq!(h.machine.state(), State::Listening);
        assert_eq!(h.session.current_feature(), "jokes");
        assert!(h.tts.spoken()[0].contains("Dial-A-Joke"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_direct_dial_hangs_up_after_intercept() {
        let route = PhoneRouter::new().route("555-9999");
        let mut h = harness(fast_config(), Some(route)).await;
        h.machine.process(&h.pipeline).await.unwrap();
        assert_eq!(h.machine.state(), State::Hangup);
        assert!(h.tts.spoken()[0].contains("not in service"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn star_returns_to_operator() {
        let mut h = harness(fast_config(), None).await;
        h.machine.process(&h.pipeline).await.unwrap(); // greeting
        h.session.switch_feature("jokes");

        h.machine.handle_dtmf('*', &h.pipeline).await.unwrap();
        assert_eq!(h.session.current_feature(), "operator");
        assert_eq!(h.machine.state(), State::MainMenu);
        assert!(h
            .tts
            .spoken()
            .iter()
            .any(|t| t.contains("main menu")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pound_routes_accumulated_number() {
        let mut h = harness(fast_config(), None).await;
        h.machine.process(&h.pipeline).await.unwrap(); // greeting
        for digit in "5558748".chars() {
            h.session.add_dtmf(digit);
        }
        h.machine.handle_dtmf('#', &h.pipeline).await.unwrap();
        assert_eq!(h.session.current_feature(), "trivia");
        assert!(h
            .tts
            .spoken()
            .iter()
            .any(|t| t.contains("Trivia Challenge")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn goodbye_phrase_transitions_to_goodbye() {
        let mut h = harness(fast_config(), None).await;
        h.machine.process(&h.pipeline).await.unwrap(); // greeting
        h.machine
            .process_transcript("okay goodbye now", &h.pipeline)
            .await
            .unwrap();
        assert_eq!(h.machine.state(), State::Goodbye);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn menu_phrase_returns_to_operator() {
        let mut h = harness(fast_config(), None).await;
        h.machine.process(&h.pipeline).await.unwrap();
        h.session.switch_feature("fortune");
        h.machine
            .process_transcript("take me to the main menu please", &h.pipeline)
            .await
            .unwrap();
        assert_eq!(h.session.current_feature(), "operator");
        assert_eq!(h.machine.state(), State::MainMenu);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn normal_turn_round_trips_to_listening() {
        let mut h = harness(fast_config(), None).await;
        h.machine.process(&h.pipeline).await.unwrap();
        h.machine
            .process_transcript("tell me a story", &h.pipeline)
            .await
            .unwrap();
        assert_eq!(h.machine.state(), State::Listening);
        assert!(h
            .tts
            .spoken()
            .iter()
            .any(|t| t.contains("perfectly fine answer")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silence_prompts_then_says_goodbye() {
        let mut h = harness(fast_config(), None).await;
        h.machine.process(&h.pipeline).await.unwrap(); // greeting → MAIN_MENU
        h.machine.process(&h.pipeline).await.unwrap(); // → LISTENING

        // Silence until the prompt fires.
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.machine.state() == State::Listening && Instant::now() < deadline {
            h.machine.process(&h.pipeline).await.unwrap();
            if h.machine.state() == State::Timeout {
                break;
            }
        }
        assert_eq!(h.machine.state(), State::Timeout);
        h.machine.process(&h.pipeline).await.unwrap(); // plays prompt
        assert!(h
            .tts
            .spoken()
            .iter()
            .any(|t| t.contains("still there")));
        assert_eq!(h.machine.state(), State::Listening);

        // Continued silence reaches GOODBYE.
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.machine.state() != State::Goodbye && Instant::now() < deadline {
            h.machine.process(&h.pipeline).await.unwrap();
        }
        assert_eq!(h.machine.state(), State::Goodbye);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn barge_in_state_clears_flag_and_listens() {
        let mut h = harness(fast_config(), None).await;
        h.machine.process(&h.pipeline).await.unwrap();
        h.session.set_speaking(true);
        h.session.request_barge_in();
        h.session.set_speaking(false);
        h.machine.transition_to(State::BargeIn, "test");
        h.machine.process(&h.pipeline).await.unwrap();
        assert!(!h.session.barge_in_requested());
        assert_eq!(h.machine.state(), State::Listening);
    }
}
