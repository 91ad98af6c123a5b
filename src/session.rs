//! Session lifecycle: one conversation at a time across the capture
//! pipeline, the playback pipeline, and the remote channel.
//!
//! The controller is the single owner of the session state. It runs one
//! `select!` loop over three queues (user intents, pipeline completions,
//! channel traffic), so every mutation happens on one logical timeline.
//! Blocking work (device acquisition) and suspension points (channel
//! open) run in spawned tasks and come back as events.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::{InputDevice, InputHandle, OutputDevice};
use crate::capture::CaptureEncoder;
use crate::codec::TransportFrame;
use crate::error::AudioError;
use crate::link::{Channel, ChannelHandle, LinkEvent, OpenParams, TranscriptLine};
use crate::playback::PlaybackScheduler;

const EVENT_QUEUE: usize = 100;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AcquiringDevice,
    Connecting,
    Active,
    Muted,
    Closing,
    Errored(AudioError),
}

impl SessionState {
    /// Conversation in progress, audio flowing in at least one direction.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Muted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringDevice => "acquiring-device",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Muted => "muted",
            SessionState::Closing => "closing",
            SessionState::Errored(_) => "errored",
        }
    }
}

/// What the user can ask of the session.
#[derive(Debug)]
pub enum SessionIntent {
    /// Start a conversation. Accepted in `Idle` and `Errored` only.
    Connect(OpenParams),
    /// Flip the capture gate between `Active` and `Muted`.
    ToggleMute,
    /// Tear everything down and return to `Idle`.
    Reset,
}

/// Completions and capture output posted back onto the controller queue.
/// Each carries the connect attempt it belongs to; events from a torn-down
/// attempt release their resource and are otherwise ignored.
pub enum PipelineEvent {
    DeviceReady {
        attempt: u64,
        handle: Box<dyn InputHandle>,
    },
    DeviceFailed {
        attempt: u64,
        error: AudioError,
    },
    ChannelReady {
        attempt: u64,
        handle: Box<dyn ChannelHandle>,
    },
    ChannelFailed {
        attempt: u64,
        error: AudioError,
    },
    Outbound {
        attempt: u64,
        frame: TransportFrame,
    },
    CaptureFailed {
        attempt: u64,
        error: AudioError,
    },
}

/// What the front-end observes. Transcript lines arrive in conversation
/// order; the front-end keeps whatever history it wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StateChanged(SessionState),
    Line(TranscriptLine),
}

/// Owner of the session state machine and of all pipeline resources.
pub struct SessionController {
    input: Arc<dyn InputDevice>,
    channel: Arc<dyn Channel>,
    playback: PlaybackScheduler,

    state: SessionState,
    attempt: u64,
    session_id: Option<Uuid>,

    capture: Option<CaptureEncoder>,
    link: Option<Box<dyn ChannelHandle>>,
    link_rx: Option<mpsc::Receiver<LinkEvent>>,
    pending_open: Option<OpenParams>,
    pending_input: Option<Box<dyn InputHandle>>,
    buffered: Vec<crate::link::ServerPayload>,

    pipeline_tx: mpsc::Sender<PipelineEvent>,
    pipeline_rx: mpsc::Receiver<PipelineEvent>,
    intent_rx: mpsc::Receiver<SessionIntent>,
    notice_tx: mpsc::Sender<SessionNotice>,
}

/// Link events come from a per-attempt receiver; while no attempt is
/// running the branch just never fires.
async fn recv_link(rx: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionController {
    pub fn new(
        input: Arc<dyn InputDevice>,
        output: Arc<dyn OutputDevice>,
        channel: Arc<dyn Channel>,
        intent_rx: mpsc::Receiver<SessionIntent>,
        notice_tx: mpsc::Sender<SessionNotice>,
    ) -> Self {
        let (pipeline_tx, pipeline_rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            input,
            channel,
            playback: PlaybackScheduler::new(output),
            state: SessionState::Idle,
            attempt: 0,
            session_id: None,
            capture: None,
            link: None,
            link_rx: None,
            pending_open: None,
            pending_input: None,
            buffered: Vec::new(),
            pipeline_tx,
            pipeline_rx,
            intent_rx,
            notice_tx,
        }
    }

    /// Event loop. Runs until the intent channel closes, then tears the
    /// session down and exits.
    pub async fn run(mut self) {
        log::info!("Session controller running");
        loop {
            tokio::select! {
                intent = self.intent_rx.recv() => {
                    match intent {
                        Some(intent) => self.handle_intent(intent).await,
                        None => break,
                    }
                }
                Some(ev) = self.pipeline_rx.recv() => {
                    self.handle_pipeline_event(ev).await;
                }
                ev = recv_link(&mut self.link_rx) => {
                    match ev {
                        Some(ev) => self.handle_link_event(ev).await,
                        None => self.handle_link_gone().await,
                    }
                }
            }
        }
        self.teardown("front-end detached").await;
        log::info!("Session controller stopped");
    }

    // ======================== User intents ========================

    async fn handle_intent(&mut self, intent: SessionIntent) {
        match intent {
            SessionIntent::Connect(params) => self.handle_connect(params).await,
            SessionIntent::ToggleMute => self.handle_toggle_mute().await,
            SessionIntent::Reset => self.teardown("user reset").await,
        }
    }

    async fn handle_connect(&mut self, params: OpenParams) {
        match self.state {
            SessionState::Idle | SessionState::Errored(_) => {}
            _ => {
                log::warn!("Connect rejected in state {}", self.state.name());
                return;
            }
        }

        self.attempt += 1;
        let attempt = self.attempt;
        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        self.pending_open = Some(params);

        self.set_state(SessionState::AcquiringDevice).await;
        log::info!("[{}] Acquiring input device", session_id);

        let device = self.input.clone();
        let tx = self.pipeline_tx.clone();
        tokio::task::spawn_blocking(move || {
            let ev = match CaptureEncoder::open(device.as_ref()) {
                Ok(handle) => PipelineEvent::DeviceReady { attempt, handle },
                Err(error) => PipelineEvent::DeviceFailed { attempt, error },
            };
            let _ = tx.blocking_send(ev);
        });
    }

    async fn handle_toggle_mute(&mut self) {
        match self.state {
            SessionState::Active => {
                if let Some(capture) = &self.capture {
                    capture.set_gated(true);
                }
                self.set_state(SessionState::Muted).await;
            }
            SessionState::Muted => {
                if let Some(capture) = &self.capture {
                    capture.set_gated(false);
                }
                self.set_state(SessionState::Active).await;
            }
            _ => log::debug!("Mute toggle ignored in state {}", self.state.name()),
        }
    }

    // ======================== Pipeline events ========================

    async fn handle_pipeline_event(&mut self, ev: PipelineEvent) {
        match ev {
            PipelineEvent::DeviceReady { attempt, handle } => {
                if attempt != self.attempt {
                    log::debug!("Releasing device granted to a torn-down attempt");
                    handle.release();
                    return;
                }
                self.on_device_ready(handle).await;
            }
            PipelineEvent::DeviceFailed { attempt, error } => {
                if attempt != self.attempt {
                    return;
                }
                log::error!("Input device acquisition failed: {}", error);
                self.fail(error).await;
            }
            PipelineEvent::ChannelReady { attempt, handle } => {
                if attempt != self.attempt {
                    log::debug!("Closing channel opened for a torn-down attempt");
                    let mut handle = handle;
                    handle.close().await;
                    return;
                }
                self.on_channel_ready(handle).await;
            }
            PipelineEvent::ChannelFailed { attempt, error } => {
                if attempt != self.attempt {
                    return;
                }
                log::error!("Channel open failed: {}", error);
                self.fail(error).await;
            }
            PipelineEvent::Outbound { attempt, frame } => {
                if attempt != self.attempt {
                    return;
                }
                self.on_outbound(frame).await;
            }
            PipelineEvent::CaptureFailed { attempt, error } => {
                if attempt != self.attempt {
                    return;
                }
                log::error!("Capture failed mid-session: {}", error);
                self.fail(error).await;
            }
        }
    }

    async fn on_device_ready(&mut self, handle: Box<dyn InputHandle>) {
        let Some(params) = self.pending_open.take() else {
            handle.release();
            self.fail(AudioError::unknown("connect parameters lost")).await;
            return;
        };
        self.pending_input = Some(handle);
        self.set_state(SessionState::Connecting).await;

        // Fresh event stream per attempt, so nothing from an old channel
        // can ever be observed.
        let (link_tx, link_rx) = mpsc::channel(EVENT_QUEUE);
        self.link_rx = Some(link_rx);

        let channel = self.channel.clone();
        let tx = self.pipeline_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let ev = match channel.open(params, link_tx).await {
                Ok(handle) => PipelineEvent::ChannelReady { attempt, handle },
                Err(error) => PipelineEvent::ChannelFailed { attempt, error },
            };
            let _ = tx.send(ev).await;
        });
    }

    async fn on_channel_ready(&mut self, handle: Box<dyn ChannelHandle>) {
        self.link = Some(handle);

        if let Err(e) = self.playback.start() {
            log::error!("Output device open failed: {}", e);
            self.fail(e).await;
            return;
        }

        let Some(input) = self.pending_input.take() else {
            self.fail(AudioError::unknown("input handle lost")).await;
            return;
        };

        let attempt = self.attempt;
        let frame_tx = self.pipeline_tx.clone();
        let error_tx = self.pipeline_tx.clone();
        let capture = CaptureEncoder::start(
            input,
            false,
            move |frame| {
                // Teardown joins the pull thread, so nothing here may wait
                // on the controller's own queue; a full queue costs the
                // frame.
                if frame_tx
                    .try_send(PipelineEvent::Outbound { attempt, frame })
                    .is_err()
                {
                    log::warn!("Pipeline queue full, capture frame dropped");
                }
            },
            move |error| {
                // Same rule, with a bounded wait for a slot before the
                // failure notice is given up on.
                let mut ev = PipelineEvent::CaptureFailed { attempt, error };
                for _ in 0..200 {
                    match error_tx.try_send(ev) {
                        Ok(()) => return,
                        Err(mpsc::error::TrySendError::Full(back)) => {
                            ev = back;
                            std::thread::sleep(std::time::Duration::from_millis(5));
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
                log::error!("Pipeline queue full, capture failure notice dropped");
            },
        );
        match capture {
            Ok(capture) => {
                self.capture = Some(capture);
                self.set_state(SessionState::Active).await;
                if let Some(id) = self.session_id {
                    log::info!("[{}] Session active", id);
                }
                let held = std::mem::take(&mut self.buffered);
                for payload in held {
                    self.apply_payload(payload).await;
                }
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_outbound(&mut self, frame: TransportFrame) {
        match self.state {
            SessionState::Active => {
                if let Some(link) = self.link.as_mut() {
                    if let Err(e) = link.send(frame).await {
                        log::error!("Outbound send failed: {}", e);
                        self.fail(e).await;
                    }
                }
            }
            // A block that cleared the gate just before a mute lands here;
            // muted means nothing goes out.
            SessionState::Muted => {}
            _ => log::debug!("Outbound frame dropped in state {}", self.state.name()),
        }
    }

    // ======================== Channel events ========================

    async fn handle_link_event(&mut self, ev: LinkEvent) {
        match ev {
            LinkEvent::Opened => log::info!("Channel setup acknowledged"),
            LinkEvent::Message(payload) => {
                if self.state == SessionState::Connecting {
                    // The remote side can speak before the open completion
                    // is processed; hold its payloads until we are active.
                    self.buffered.push(payload);
                } else if self.state.is_live() {
                    self.apply_payload(payload).await;
                } else {
                    log::debug!("Inbound payload dropped in state {}", self.state.name());
                }
            }
            LinkEvent::Closed => {
                if self.state.is_live() || self.state == SessionState::Connecting {
                    log::warn!("Channel closed unexpectedly");
                    self.fail(AudioError::channel("closed by remote")).await;
                } else {
                    log::debug!("Channel closed");
                }
            }
            LinkEvent::Error(e) => {
                if self.state.is_live() || self.state == SessionState::Connecting {
                    log::error!("Channel error: {}", e);
                    self.fail(e).await;
                } else {
                    log::debug!("Channel error after teardown: {}", e);
                }
            }
        }
    }

    async fn handle_link_gone(&mut self) {
        self.link_rx = None;
        if self.state.is_live() || self.state == SessionState::Connecting {
            self.fail(AudioError::channel("channel event stream ended")).await;
        }
    }

    async fn apply_payload(&mut self, payload: crate::link::ServerPayload) {
        // Interruption first: it invalidates queued audio, including any
        // carried in this same message ahead of the new turn.
        if payload.interrupted {
            log::info!("Remote interruption, flushing playback");
            self.playback.flush();
        }

        for frame in &payload.audio {
            if let Err(e) = self.playback.enqueue(frame) {
                log::warn!("Dropped inbound frame: {}", e);
            }
        }

        for line in payload.lines {
            let _ = self.notice_tx.send(SessionNotice::Line(line)).await;
        }

        if payload.turn_complete {
            log::debug!("Remote turn complete");
        }
    }

    // ======================== Teardown ========================

    async fn fail(&mut self, error: AudioError) {
        self.release_resources().await;
        self.set_state(SessionState::Errored(error)).await;
    }

    async fn teardown(&mut self, reason: &str) {
        log::info!("Teardown: {}", reason);
        self.set_state(SessionState::Closing).await;
        self.release_resources().await;
        self.set_state(SessionState::Idle).await;
    }

    /// Release everything the current attempt holds, in outbound-first
    /// order: stop producing frames, close the channel, silence output.
    /// Safe from any state, including when nothing is held.
    async fn release_resources(&mut self) {
        // Strand every in-flight completion of this attempt.
        self.attempt += 1;
        self.pending_open = None;
        self.buffered.clear();

        if let Some(capture) = self.capture.take() {
            // stop() joins the pull thread; keep that off the runtime.
            let _ = tokio::task::spawn_blocking(move || {
                let mut capture = capture;
                capture.stop();
            })
            .await;
        }
        if let Some(handle) = self.pending_input.take() {
            handle.release();
        }
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.link_rx = None;
        self.playback.stop();

        if let Some(id) = self.session_id.take() {
            log::info!("[{}] Session resources released", id);
        }
    }

    async fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        log::info!("Session state: {} -> {}", self.state.name(), next.name());
        self.state = next.clone();
        let _ = self.notice_tx.send(SessionNotice::StateChanged(next)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::InputConfig;
    use crate::codec;
    use crate::link::{Role, ServerPayload};
    use async_trait::async_trait;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    type PullItem = Result<Vec<f32>, AudioError>;

    // ======================== Input fake ========================

    #[derive(Default)]
    struct InputState {
        fail_with: Option<AudioError>,
        feed: Option<std_mpsc::Receiver<PullItem>>,
        hold: Option<std_mpsc::Receiver<()>>,
        grants: usize,
        releases: usize,
        pulls: usize,
        /// Every `pull` entry, including empty idle ticks.
        ticks: usize,
    }

    #[derive(Clone)]
    struct TestInput {
        state: Arc<Mutex<InputState>>,
    }

    struct TestInputHandle {
        feed: Option<std_mpsc::Receiver<PullItem>>,
        state: Arc<Mutex<InputState>>,
    }

    impl TestInput {
        fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(InputState::default())),
            }
        }

        fn set_feed(&self, feed: std_mpsc::Receiver<PullItem>) {
            self.state.lock().unwrap().feed = Some(feed);
        }

        fn set_fail(&self, error: AudioError) {
            self.state.lock().unwrap().fail_with = Some(error);
        }

        fn set_hold(&self, gate: std_mpsc::Receiver<()>) {
            self.state.lock().unwrap().hold = Some(gate);
        }

        fn grants(&self) -> usize {
            self.state.lock().unwrap().grants
        }

        fn releases(&self) -> usize {
            self.state.lock().unwrap().releases
        }

        fn pulls(&self) -> usize {
            self.state.lock().unwrap().pulls
        }

        fn ticks(&self) -> usize {
            self.state.lock().unwrap().ticks
        }
    }

    impl InputDevice for TestInput {
        fn request_access(
            &self,
            _config: &InputConfig,
        ) -> Result<Box<dyn InputHandle>, AudioError> {
            let gate = self.state.lock().unwrap().hold.take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
            let mut st = self.state.lock().unwrap();
            if let Some(e) = st.fail_with.clone() {
                return Err(e);
            }
            st.grants += 1;
            let feed = st.feed.take();
            Ok(Box::new(TestInputHandle {
                feed,
                state: self.state.clone(),
            }))
        }
    }

    impl InputHandle for TestInputHandle {
        fn pull(&mut self) -> Result<Vec<f32>, AudioError> {
            self.state.lock().unwrap().ticks += 1;
            match &self.feed {
                Some(rx) => match rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(item) => {
                        self.state.lock().unwrap().pulls += 1;
                        item
                    }
                    Err(_) => Ok(Vec::new()),
                },
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(Vec::new())
                }
            }
        }

        fn release(self: Box<Self>) {
            self.state.lock().unwrap().releases += 1;
        }
    }

    // ======================== Output fake ========================

    #[derive(Default)]
    struct OutputState {
        now: f64,
        fail_open: bool,
        opens: usize,
        releases: usize,
        flushes: usize,
        scheduled: Vec<(usize, f64)>,
    }

    #[derive(Clone)]
    struct TestOutput {
        state: Arc<Mutex<OutputState>>,
    }

    struct TestOutputHandle {
        state: Arc<Mutex<OutputState>>,
    }

    impl TestOutput {
        fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(OutputState::default())),
            }
        }

        fn opens(&self) -> usize {
            self.state.lock().unwrap().opens
        }

        fn releases(&self) -> usize {
            self.state.lock().unwrap().releases
        }

        fn flushes(&self) -> usize {
            self.state.lock().unwrap().flushes
        }

        fn starts(&self) -> Vec<f64> {
            self.state
                .lock()
                .unwrap()
                .scheduled
                .iter()
                .map(|&(_, at)| at)
                .collect()
        }
    }

    impl OutputDevice for TestOutput {
        fn open(&self, _sample_rate: u32) -> Result<Box<dyn crate::audio::OutputHandle>, AudioError> {
            let mut st = self.state.lock().unwrap();
            if st.fail_open {
                return Err(AudioError::unknown("speaker open failed"));
            }
            st.opens += 1;
            Ok(Box::new(TestOutputHandle {
                state: self.state.clone(),
            }))
        }
    }

    impl crate::audio::OutputHandle for TestOutputHandle {
        fn clock_now(&self) -> f64 {
            self.state.lock().unwrap().now
        }

        fn schedule(&mut self, samples: Vec<f32>, at: f64) -> Result<(), AudioError> {
            self.state.lock().unwrap().scheduled.push((samples.len(), at));
            Ok(())
        }

        fn flush(&mut self) {
            let mut st = self.state.lock().unwrap();
            st.flushes += 1;
            st.scheduled.clear();
        }

        fn release(self: Box<Self>) {
            self.state.lock().unwrap().releases += 1;
        }
    }

    // ======================== Channel fake ========================

    #[derive(Default)]
    struct ChanState {
        fail_open: bool,
        fail_send: bool,
        greet_early: Option<ServerPayload>,
        opens: usize,
        closes: usize,
        sent: Vec<TransportFrame>,
        last_params: Option<OpenParams>,
        events: Option<mpsc::Sender<LinkEvent>>,
    }

    #[derive(Clone)]
    struct TestChannel {
        state: Arc<Mutex<ChanState>>,
    }

    struct TestChannelHandle {
        state: Arc<Mutex<ChanState>>,
    }

    impl TestChannel {
        fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(ChanState::default())),
            }
        }

        fn set_fail_open(&self, fail: bool) {
            self.state.lock().unwrap().fail_open = fail;
        }

        fn set_fail_send(&self, fail: bool) {
            self.state.lock().unwrap().fail_send = fail;
        }

        fn set_greeting(&self, payload: ServerPayload) {
            self.state.lock().unwrap().greet_early = Some(payload);
        }

        fn opens(&self) -> usize {
            self.state.lock().unwrap().opens
        }

        fn closes(&self) -> usize {
            self.state.lock().unwrap().closes
        }

        fn sent(&self) -> Vec<TransportFrame> {
            self.state.lock().unwrap().sent.clone()
        }

        fn voice_of_last_open(&self) -> Option<String> {
            self.state
                .lock()
                .unwrap()
                .last_params
                .as_ref()
                .map(|p| p.voice_id.clone())
        }

        async fn emit(&self, ev: LinkEvent) {
            let tx = self
                .state
                .lock()
                .unwrap()
                .events
                .clone()
                .expect("channel not open");
            tx.send(ev).await.expect("link event receiver gone");
        }
    }

    #[async_trait]
    impl Channel for TestChannel {
        async fn open(
            &self,
            params: OpenParams,
            events: mpsc::Sender<LinkEvent>,
        ) -> Result<Box<dyn ChannelHandle>, AudioError> {
            let greeting = {
                let mut st = self.state.lock().unwrap();
                if st.fail_open {
                    return Err(AudioError::channel("remote refused"));
                }
                st.opens += 1;
                st.last_params = Some(params);
                st.events = Some(events.clone());
                st.greet_early.take()
            };
            let _ = events.send(LinkEvent::Opened).await;
            if let Some(payload) = greeting {
                let _ = events.send(LinkEvent::Message(payload)).await;
            }
            Ok(Box::new(TestChannelHandle {
                state: self.state.clone(),
            }))
        }
    }

    #[async_trait]
    impl ChannelHandle for TestChannelHandle {
        async fn send(&mut self, frame: TransportFrame) -> Result<(), AudioError> {
            let mut st = self.state.lock().unwrap();
            if st.fail_send {
                return Err(AudioError::channel("send failed"));
            }
            st.sent.push(frame);
            Ok(())
        }

        async fn close(&mut self) {
            self.state.lock().unwrap().closes += 1;
        }
    }

    // ======================== Harness ========================

    struct Harness {
        intents: mpsc::Sender<SessionIntent>,
        notices: mpsc::Receiver<SessionNotice>,
        input: TestInput,
        output: TestOutput,
        channel: TestChannel,
    }

    fn harness() -> Harness {
        let input = TestInput::new();
        let output = TestOutput::new();
        let channel = TestChannel::new();
        let (intent_tx, intent_rx) = mpsc::channel(16);
        let (notice_tx, notice_rx) = mpsc::channel(EVENT_QUEUE);
        let controller = SessionController::new(
            Arc::new(input.clone()),
            Arc::new(output.clone()),
            Arc::new(channel.clone()),
            intent_rx,
            notice_tx,
        );
        tokio::spawn(controller.run());
        Harness {
            intents: intent_tx,
            notices: notice_rx,
            input,
            output,
            channel,
        }
    }

    fn params() -> OpenParams {
        OpenParams {
            system_prompt: "You can only discuss the supplied document.".into(),
            voice_id: "Kore".into(),
        }
    }

    fn mic_frame(samples: &[f32]) -> TransportFrame {
        codec::to_transport(&codec::encode_to_pcm16(samples), codec::CAPTURE_SAMPLE_RATE)
    }

    fn speaker_frame(n: usize) -> TransportFrame {
        codec::to_transport(&codec::encode_to_pcm16(&vec![0.2; n]), codec::PLAYBACK_SAMPLE_RATE)
    }

    impl Harness {
        async fn next_notice(&mut self) -> SessionNotice {
            timeout(Duration::from_secs(2), self.notices.recv())
                .await
                .expect("timed out waiting for a notice")
                .expect("notice stream closed")
        }

        async fn next_state(&mut self) -> SessionState {
            loop {
                if let SessionNotice::StateChanged(s) = self.next_notice().await {
                    return s;
                }
            }
        }

        async fn connect(&mut self) {
            self.intents
                .send(SessionIntent::Connect(params()))
                .await
                .unwrap();
            assert_eq!(self.next_state().await, SessionState::AcquiringDevice);
            assert_eq!(self.next_state().await, SessionState::Connecting);
            assert_eq!(self.next_state().await, SessionState::Active);
        }

        /// Drop the intent sender while keeping the harness usable.
        fn detach_frontend(&mut self) {
            let (dummy, _) = mpsc::channel(1);
            let _ = std::mem::replace(&mut self.intents, dummy);
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    // ======================== Lifecycle ========================

    #[tokio::test]
    async fn connect_walks_the_happy_path() {
        let mut h = harness();
        h.connect().await;

        assert_eq!(h.input.grants(), 1);
        assert_eq!(h.channel.opens(), 1);
        assert_eq!(h.output.opens(), 1);
        assert_eq!(h.channel.voice_of_last_open().as_deref(), Some("Kore"));
    }

    #[tokio::test]
    async fn connect_rejected_while_session_exists() {
        let mut h = harness();
        h.connect().await;

        // A second connect must do nothing; the mute toggle right behind
        // it shows the state machine never moved.
        h.intents
            .send(SessionIntent::Connect(params()))
            .await
            .unwrap();
        h.intents.send(SessionIntent::ToggleMute).await.unwrap();
        assert_eq!(h.next_state().await, SessionState::Muted);
        assert_eq!(h.channel.opens(), 1);
        assert_eq!(h.input.grants(), 1);
    }

    #[tokio::test]
    async fn reset_releases_everything_then_reconnects() {
        let mut h = harness();
        h.connect().await;

        h.intents.send(SessionIntent::Reset).await.unwrap();
        assert_eq!(h.next_state().await, SessionState::Closing);
        assert_eq!(h.next_state().await, SessionState::Idle);

        // The idle notice is sent only after release finished.
        assert_eq!(h.input.releases(), 1);
        assert_eq!(h.channel.closes(), 1);
        assert_eq!(h.output.releases(), 1);

        h.connect().await;
        assert_eq!(h.input.grants(), 2);
        assert_eq!(h.channel.opens(), 2);
        assert_eq!(h.output.opens(), 2);
    }

    #[tokio::test]
    async fn frontend_detach_tears_down() {
        let mut h = harness();
        h.connect().await;

        h.detach_frontend();
        assert_eq!(h.next_state().await, SessionState::Closing);
        assert_eq!(h.next_state().await, SessionState::Idle);
        // Controller exits and the notice stream ends.
        assert!(timeout(Duration::from_secs(2), h.notices.recv())
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.input.releases(), 1);
        assert_eq!(h.channel.closes(), 1);
        assert_eq!(h.output.releases(), 1);
    }

    // ======================== Mute ========================

    #[tokio::test]
    async fn mute_gates_outbound_and_unmute_resumes() {
        let (feed_tx, feed_rx) = std_mpsc::channel();
        let mut h = harness();
        h.input.set_feed(feed_rx);
        h.connect().await;

        h.intents.send(SessionIntent::ToggleMute).await.unwrap();
        assert_eq!(h.next_state().await, SessionState::Muted);

        // Blocks keep being pulled while muted; none may go out.
        for _ in 0..3 {
            feed_tx.send(Ok(vec![0.3; 16])).unwrap();
        }
        let input = h.input.clone();
        wait_until(move || input.pulls() >= 3).await;
        // A later pull starting proves the third block cleared the gate
        // check, so unmuting now cannot resurrect it.
        let settled = h.input.ticks();
        let input = h.input.clone();
        wait_until(move || input.ticks() > settled).await;
        assert!(h.channel.sent().is_empty());

        h.intents.send(SessionIntent::ToggleMute).await.unwrap();
        assert_eq!(h.next_state().await, SessionState::Active);

        feed_tx.send(Ok(vec![0.9; 16])).unwrap();
        let channel = h.channel.clone();
        wait_until(move || !channel.sent().is_empty()).await;

        // Only the post-unmute block went out; the pipeline is ordered,
        // so a leaked muted block would have arrived first.
        let sent = h.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], mic_frame(&[0.9; 16]));
        assert_eq!(sent[0].mime_type, "audio/pcm;rate=16000");
    }

    #[tokio::test]
    async fn mute_toggle_ignored_when_not_live() {
        let mut h = harness();
        h.intents.send(SessionIntent::ToggleMute).await.unwrap();
        // Still idle: the next connect starts from scratch.
        h.connect().await;
    }

    // ======================== Inbound audio & transcript ========================

    #[tokio::test]
    async fn inbound_burst_schedules_gapless() {
        let mut h = harness();
        h.connect().await;

        let frame = speaker_frame(2048);
        h.channel
            .emit(LinkEvent::Message(ServerPayload {
                audio: vec![frame.clone(), frame],
                ..ServerPayload::default()
            }))
            .await;

        let output = h.output.clone();
        wait_until(move || output.starts().len() == 2).await;
        let starts = h.output.starts();
        let step = 2048.0 / 24_000.0;
        assert!((starts[1] - starts[0] - step).abs() < 1e-9);
    }

    #[tokio::test]
    async fn interruption_flushes_playback_only() {
        let (feed_tx, feed_rx) = std_mpsc::channel();
        let mut h = harness();
        h.input.set_feed(feed_rx);
        h.connect().await;

        h.channel
            .emit(LinkEvent::Message(ServerPayload {
                audio: vec![speaker_frame(2400), speaker_frame(2400)],
                ..ServerPayload::default()
            }))
            .await;
        let output = h.output.clone();
        wait_until(move || output.starts().len() == 2).await;

        h.channel
            .emit(LinkEvent::Message(ServerPayload {
                interrupted: true,
                ..ServerPayload::default()
            }))
            .await;
        let output = h.output.clone();
        wait_until(move || output.flushes() == 1).await;
        assert!(h.output.starts().is_empty());

        // Capture kept running: the next block still goes out.
        feed_tx.send(Ok(vec![0.4; 16])).unwrap();
        let channel = h.channel.clone();
        wait_until(move || !channel.sent().is_empty()).await;

        // And the state never left Active.
        h.intents.send(SessionIntent::ToggleMute).await.unwrap();
        assert_eq!(h.next_state().await, SessionState::Muted);
    }

    #[tokio::test]
    async fn transcript_lines_flow_in_order() {
        let mut h = harness();
        h.connect().await;

        h.channel
            .emit(LinkEvent::Message(ServerPayload {
                lines: vec![
                    TranscriptLine::user("what does it say"),
                    TranscriptLine::agent("the document says"),
                ],
                ..ServerPayload::default()
            }))
            .await;

        assert_eq!(
            h.next_notice().await,
            SessionNotice::Line(TranscriptLine::user("what does it say"))
        );
        match h.next_notice().await {
            SessionNotice::Line(line) => {
                assert_eq!(line.role, Role::Agent);
                assert_eq!(line.text, "the document says");
            }
            other => panic!("expected a transcript line, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn early_greeting_audio_is_not_lost() {
        let mut h = harness();
        h.channel.set_greeting(ServerPayload {
            audio: vec![speaker_frame(1200)],
            lines: vec![TranscriptLine::agent("hello")],
            ..ServerPayload::default()
        });
        h.connect().await;

        let output = h.output.clone();
        wait_until(move || output.starts().len() == 1).await;
        assert_eq!(
            h.next_notice().await,
            SessionNotice::Line(TranscriptLine::agent("hello"))
        );
    }

    // ======================== Failures ========================

    #[tokio::test]
    async fn device_denial_is_classified() {
        let mut h = harness();
        h.input
            .set_fail(AudioError::PermissionDenied("mic blocked".into()));

        h.intents
            .send(SessionIntent::Connect(params()))
            .await
            .unwrap();
        assert_eq!(h.next_state().await, SessionState::AcquiringDevice);
        assert_eq!(
            h.next_state().await,
            SessionState::Errored(AudioError::PermissionDenied("mic blocked".into()))
        );
        assert_eq!(h.channel.opens(), 0);
        assert_eq!(h.output.opens(), 0);
    }

    #[tokio::test]
    async fn channel_refusal_releases_the_device() {
        let mut h = harness();
        h.channel.set_fail_open(true);

        h.intents
            .send(SessionIntent::Connect(params()))
            .await
            .unwrap();
        assert_eq!(h.next_state().await, SessionState::AcquiringDevice);
        assert_eq!(h.next_state().await, SessionState::Connecting);
        assert_eq!(
            h.next_state().await,
            SessionState::Errored(AudioError::channel("remote refused"))
        );
        assert_eq!(h.input.releases(), 1);
        assert_eq!(h.output.opens(), 0);
    }

    #[tokio::test]
    async fn retry_from_errored_starts_from_scratch() {
        let mut h = harness();
        h.channel.set_fail_open(true);
        h.intents
            .send(SessionIntent::Connect(params()))
            .await
            .unwrap();
        assert_eq!(h.next_state().await, SessionState::AcquiringDevice);
        assert_eq!(h.next_state().await, SessionState::Connecting);
        assert!(matches!(h.next_state().await, SessionState::Errored(_)));

        h.channel.set_fail_open(false);
        h.connect().await;
        assert_eq!(h.input.grants(), 2);
        assert_eq!(h.channel.opens(), 1);
    }

    #[tokio::test]
    async fn remote_close_mid_session_is_an_error() {
        let mut h = harness();
        h.connect().await;

        h.channel.emit(LinkEvent::Closed).await;
        assert_eq!(
            h.next_state().await,
            SessionState::Errored(AudioError::channel("closed by remote"))
        );
        assert_eq!(h.input.releases(), 1);
        assert_eq!(h.output.releases(), 1);
        assert_eq!(h.channel.closes(), 1);
    }

    #[tokio::test]
    async fn capture_failure_mid_session_fails_the_session() {
        let (feed_tx, feed_rx) = std_mpsc::channel();
        let mut h = harness();
        h.input.set_feed(feed_rx);
        h.connect().await;

        feed_tx
            .send(Err(AudioError::DeviceNotFound("unplugged".into())))
            .unwrap();
        assert_eq!(
            h.next_state().await,
            SessionState::Errored(AudioError::DeviceNotFound("unplugged".into()))
        );
        assert_eq!(h.channel.closes(), 1);
        assert_eq!(h.output.releases(), 1);
    }

    #[tokio::test]
    async fn outbound_send_failure_fails_the_session() {
        let (feed_tx, feed_rx) = std_mpsc::channel();
        let mut h = harness();
        h.input.set_feed(feed_rx);
        h.connect().await;
        h.channel.set_fail_send(true);

        feed_tx.send(Ok(vec![0.5; 16])).unwrap();
        assert_eq!(
            h.next_state().await,
            SessionState::Errored(AudioError::channel("send failed"))
        );
    }

    #[tokio::test]
    async fn stale_device_grant_is_released_after_reset() {
        let (hold_tx, hold_rx) = std_mpsc::channel();
        let mut h = harness();
        h.input.set_hold(hold_rx);

        h.intents
            .send(SessionIntent::Connect(params()))
            .await
            .unwrap();
        assert_eq!(h.next_state().await, SessionState::AcquiringDevice);

        h.intents.send(SessionIntent::Reset).await.unwrap();
        assert_eq!(h.next_state().await, SessionState::Closing);
        assert_eq!(h.next_state().await, SessionState::Idle);

        // Let the stuck acquisition finish; its grant belongs to a dead
        // attempt and must be handed straight back.
        hold_tx.send(()).unwrap();
        let input = h.input.clone();
        wait_until(move || input.releases() == 1).await;
        assert_eq!(h.input.grants(), 1);
        assert_eq!(h.channel.opens(), 0);

        // The controller is cleanly idle.
        h.connect().await;
        assert_eq!(h.input.grants(), 2);
    }
}
