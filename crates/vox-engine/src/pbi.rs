//! Playback Instance (PBI) state machine
//!
//! One live voice. Its initial state is resolved before the source is
//! connected; after that, pause/stop/pre-stop/virtual are orthogonal flags.
//!
//! ```text
//!            Play ──▶ [Playing]──Pause──▶[Paused]
//!   (not connected)      │  ▲               │
//!        Stop ──▶ [Stopped] │ Resume ◀──────┘
//!                        │
//!                 Stop(fade) ─▶ pre-stopped ─▶ fade done ─▶ stopped ─▶ Term
//! ```
//!
//! Fades are transitions whose user is this voice. The PBI keeps the id of
//! its running play/stop and pause/resume fades so that a reversal (Stop
//! during a fade-in, Resume during a pause fade) re-targets the running
//! ramp instead of starting a second one.

use std::collections::BTreeMap;
use std::fmt;

use smallvec::SmallVec;

use vox_core::{
    FadeCurve, GameObjectId, NodeId, PlayingId, SequenceId, TimeBase,
};
use vox_event::{NotificationReason, NotificationSink, SeekPosition, TransitionSpec};

use crate::containers::ContinuousTransition;
use crate::continuation::{ContinuationList, PlayHistory};
use crate::hierarchy::ActivityChains;
use crate::limiter::LimiterKey;
use crate::lower::codec::{CodecId, MediaData, SourceType, PCM_CODEC};
use crate::lower::command::{LowerCommand, LowerCommandKind, NO_SEQUENCE};
use crate::transition::{
    AddOutcome, FadeKind, TransitionId, TransitionManager, TransitionParams, TransitionUser,
};

// ═══════════════════════════════════════════════════════════════════════════════
// IDS AND FLAGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Voice identifier, unique for the engine's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PbiId(pub u64);

impl fmt::Display for PbiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pbi{}", self.0)
    }
}

/// State resolved before the voice connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitState {
    #[default]
    Playing,
    Paused,
    /// Stopped before connecting; the voice never becomes audible
    Stopped,
}

/// Runtime flags; not mutually exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PbiFlags {
    pub was_stopped: bool,
    /// Fade-to-stop requested, not finished
    pub was_pre_stopped: bool,
    pub was_paused: bool,
    pub is_virtual: bool,
    /// Forced out by a limiter
    pub was_kicked: bool,
    /// At least one frame rendered or skipped
    pub was_played: bool,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Already stopped or stopping; nothing happened
    AlreadyStopping,
    /// Stopped now; terminate this tick
    Immediate,
    /// Fading out; terminates when the fade completes
    Fading,
}

/// What a fade update means for the voice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeEvent {
    None,
    /// Stop fade reached silence
    StopReached,
}

enum FadeStart {
    Running,
    Done,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTINUATION STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Element selected to follow the current one
#[derive(Debug, Clone, PartialEq)]
pub struct NextElement {
    pub node: NodeId,
    pub also: SmallVec<[NodeId; 2]>,
    pub history: PlayHistory,
    pub list: ContinuationList,
}

/// Chain state of a continuous voice
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub history: PlayHistory,
    pub list: ContinuationList,
    pub transition: ContinuousTransition,
    pub transition_ms: f32,
    /// Precomputed next element
    pub next: Option<NextElement>,
    /// The next element was already posted ahead of termination
    pub scheduled: bool,
}

impl ChainState {
    pub fn new(history: PlayHistory, list: ContinuationList) -> Self {
        Self {
            history,
            list,
            transition: ContinuousTransition::Disabled,
            transition_ms: 0.0,
            next: None,
            scheduled: false,
        }
    }

    pub fn with_transition(mut self, transition: ContinuousTransition, ms: f32) -> Self {
        self.transition = transition;
        self.transition_ms = ms;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// Collaborators a state change may touch
pub struct PbiCtx<'a> {
    pub transitions: &'a mut TransitionManager,
    pub commands: &'a mut Vec<LowerCommand>,
    pub sink: &'a dyn NotificationSink,
    pub time: TimeBase,
    /// Fade substituted for zero-length stops
    pub min_stop_fade_ms: f32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PBI
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Pbi {
    pub id: PbiId,
    pub node: NodeId,
    pub game_object: GameObjectId,
    pub playing_id: PlayingId,
    pub custom_param: u64,
    pub codec: CodecId,
    pub source_type: SourceType,
    /// Held for the voice's lifetime
    pub media: Option<MediaData>,
    pub init_state: InitState,
    pub flags: PbiFlags,
    play_stop_ratio: f32,
    pause_resume_ratio: f32,
    play_stop_fade: Option<TransitionId>,
    pause_fade: Option<TransitionId>,
    pause_count: u32,
    /// Seek waiting for the source to connect
    pub seek: Option<SeekPosition>,
    /// 0 = infinite
    pub loop_count: u16,
    pub base_priority: f32,
    pub distance_offset: f32,
    /// Sub-tick start offset (frames)
    pub frame_offset: u32,
    pub sequence_id: SequenceId,
    pub limiters: SmallVec<[LimiterKey; 3]>,
    pub chain: Option<Box<ChainState>>,
    instigator: Option<NodeId>,
    /// Source connected and started by the lower engine
    pub connected: bool,
    /// Chains counted when the voice started; undone on termination
    pub activity: Option<ActivityChains>,
    lower_paused: bool,
}

impl Pbi {
    pub fn new(id: PbiId, node: NodeId, game_object: GameObjectId, playing_id: PlayingId) -> Self {
        Self {
            id,
            node,
            game_object,
            playing_id,
            custom_param: 0,
            codec: PCM_CODEC,
            source_type: SourceType::Bank,
            media: None,
            init_state: InitState::Playing,
            flags: PbiFlags::default(),
            play_stop_ratio: 1.0,
            pause_resume_ratio: 1.0,
            play_stop_fade: None,
            pause_fade: None,
            pause_count: 0,
            seek: None,
            loop_count: 1,
            base_priority: 50.0,
            distance_offset: 0.0,
            frame_offset: 0,
            sequence_id: NO_SEQUENCE,
            limiters: SmallVec::new(),
            chain: None,
            instigator: None,
            connected: false,
            activity: None,
            lower_paused: false,
        }
    }

    pub fn with_custom_param(mut self, custom_param: u64) -> Self {
        self.custom_param = custom_param;
        self
    }

    pub fn with_priority(mut self, priority: f32) -> Self {
        self.base_priority = priority;
        self
    }

    pub fn with_sequence(mut self, seq: SequenceId) -> Self {
        self.sequence_id = seq;
        self
    }

    pub fn with_frame_offset(mut self, frames: u32) -> Self {
        self.frame_offset = frames;
        self
    }

    pub fn with_chain(mut self, chain: ChainState) -> Self {
        self.chain = Some(Box::new(chain));
        self
    }

    // ───────────────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────────────

    /// Effective priority, 0-100
    #[inline]
    pub fn priority(&self) -> f32 {
        (self.base_priority + self.distance_offset).clamp(0.0, 100.0)
    }

    #[inline]
    pub fn play_stop_ratio(&self) -> f32 {
        self.play_stop_ratio
    }

    #[inline]
    pub fn pause_resume_ratio(&self) -> f32 {
        self.pause_resume_ratio
    }

    /// Product of the fade ratios
    #[inline]
    pub fn fade_gain(&self) -> f32 {
        self.play_stop_ratio * self.pause_resume_ratio
    }

    #[inline]
    pub fn pause_count(&self) -> u32 {
        self.pause_count
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.pause_count > 0
    }

    #[inline]
    pub fn is_lower_paused(&self) -> bool {
        self.lower_paused
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.flags.was_stopped || self.flags.was_pre_stopped
    }

    #[inline]
    pub fn instigator(&self) -> Option<NodeId> {
        self.instigator
    }

    pub fn set_instigator(&mut self, node: NodeId) {
        debug_assert!(self.instigator.is_none(), "instigator set twice on {}", self.id);
        self.instigator = Some(node);
    }

    /// Carry a pause depth into a continuation voice
    pub fn inherit_pause_count(&mut self, count: u32) {
        self.pause_count = count;
        if count > 0 {
            self.flags.was_paused = true;
            if self.init_state == InitState::Playing {
                self.init_state = InitState::Paused;
            }
        }
    }

    fn notify(&self, sink: &dyn NotificationSink, reason: NotificationReason, extra: f32) {
        sink.post_notification(
            reason,
            self.playing_id,
            self.game_object,
            self.custom_param,
            self.node,
            extra,
        );
    }

    /// Post a notification about this voice
    pub fn post(&self, sink: &dyn NotificationSink, reason: NotificationReason) {
        self.notify(sink, reason, 0.0);
    }

    fn push(&self, ctx: &mut PbiCtx<'_>, kind: LowerCommandKind) {
        ctx.commands
            .push(LowerCommand::new(self.id, kind).with_seq(self.sequence_id));
    }

    // ───────────────────────────────────────────────────────────────────────
    // Fades
    // ───────────────────────────────────────────────────────────────────────

    fn fade_slot(&mut self, kind: FadeKind) -> &mut Option<TransitionId> {
        match kind {
            FadeKind::PlayStop => &mut self.play_stop_fade,
            FadeKind::PauseResume => &mut self.pause_fade,
        }
    }

    fn set_ratio(&mut self, kind: FadeKind, value: f32) {
        match kind {
            FadeKind::PlayStop => self.play_stop_ratio = value,
            FadeKind::PauseResume => self.pause_resume_ratio = value,
        }
    }

    fn ratio(&self, kind: FadeKind) -> f32 {
        match kind {
            FadeKind::PlayStop => self.play_stop_ratio,
            FadeKind::PauseResume => self.pause_resume_ratio,
        }
    }

    /// Ramp a fade ratio, re-targeting a running ramp of the same kind
    fn start_fade(
        &mut self,
        kind: FadeKind,
        target: f32,
        duration: u64,
        curve: FadeCurve,
        ctx: &mut PbiCtx<'_>,
    ) -> FadeStart {
        let user = TransitionUser::Voice { pbi: self.id, kind };
        let running = self.fade_slot(kind).filter(|id| ctx.transitions.contains(*id));

        if let Some(id) = running {
            if duration > 0 && ctx.transitions.change_parameter(id, target, duration, curve).is_ok() {
                return FadeStart::Running;
            }
            ctx.transitions.remove_user(id, user);
            *self.fade_slot(kind) = None;
            self.set_ratio(kind, target);
            return FadeStart::Done;
        }

        let params = TransitionParams::new(self.ratio(kind), target, duration, curve);
        match ctx.transitions.add(params, user) {
            Ok(AddOutcome::Immediate(value)) => {
                self.set_ratio(kind, value);
                FadeStart::Done
            }
            Ok(AddOutcome::Started(id)) => {
                *self.fade_slot(kind) = Some(id);
                self.notify(ctx.sink, NotificationReason::FadeStarted, target);
                FadeStart::Running
            }
            Err(e) => {
                log::warn!("{}: fade not started ({}), applying target", self.id, e);
                self.set_ratio(kind, target);
                FadeStart::Done
            }
        }
    }

    /// Apply a transition update addressed to this voice
    pub fn on_fade(&mut self, kind: FadeKind, value: f32, terminated: bool, ctx: &mut PbiCtx<'_>) -> FadeEvent {
        self.set_ratio(kind, value);
        if !terminated {
            return FadeEvent::None;
        }
        *self.fade_slot(kind) = None;
        self.notify(ctx.sink, NotificationReason::FadeCompleted, value);

        match kind {
            FadeKind::PlayStop if self.flags.was_pre_stopped && value <= 0.0 => {
                self.flags.was_stopped = true;
                FadeEvent::StopReached
            }
            FadeKind::PauseResume if self.pause_count > 0 && value <= 0.0 => {
                self.settle_paused(ctx);
                FadeEvent::None
            }
            _ => FadeEvent::None,
        }
    }

    /// Hold or release a running play/stop ramp
    fn hold_play_fade(&self, held: bool, ctx: &mut PbiCtx<'_>) {
        let Some(id) = self.play_stop_fade else {
            return;
        };
        if held {
            ctx.transitions.pause(id);
        } else {
            ctx.transitions.resume(id);
        }
    }

    /// The pause reached silence: freeze the play/stop ramp and pause below
    fn settle_paused(&mut self, ctx: &mut PbiCtx<'_>) {
        self.hold_play_fade(true, ctx);
        if self.connected && !self.lower_paused {
            self.push(ctx, LowerCommandKind::Pause);
            self.lower_paused = true;
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // State machine
    // ───────────────────────────────────────────────────────────────────────

    /// Start playback: optional fade-in, then a lower Play or PlayPause
    pub fn play(&mut self, fade: TransitionSpec, reason: NotificationReason, ctx: &mut PbiCtx<'_>) {
        if !fade.is_instant() {
            self.play_stop_ratio = 0.0;
            self.start_fade(FadeKind::PlayStop, 1.0, fade.samples(&ctx.time), fade.curve, ctx);
            if self.is_paused() {
                self.hold_play_fade(true, ctx);
            }
        }
        let kind = match self.init_state {
            InitState::Paused => LowerCommandKind::PlayPause,
            _ => LowerCommandKind::Play,
        };
        self.push(ctx, kind);
        self.notify(ctx.sink, reason, 0.0);
    }

    /// Stop, with a fade unless paused or not yet connected.
    ///
    /// A zero-length stop gets the minimum fade when `use_min_fade` is set,
    /// so that it does not click.
    pub fn stop(&mut self, fade: TransitionSpec, use_min_fade: bool, ctx: &mut PbiCtx<'_>) -> StopOutcome {
        if self.is_stopping() {
            return StopOutcome::AlreadyStopping;
        }
        if !self.connected {
            self.init_state = InitState::Stopped;
            self.flags.was_stopped = true;
            return StopOutcome::Immediate;
        }
        if self.is_paused() {
            self.flags.was_stopped = true;
            return StopOutcome::Immediate;
        }

        let mut duration = fade.samples(&ctx.time);
        if duration == 0 && use_min_fade {
            duration = ctx.time.ms_to_samples(ctx.min_stop_fade_ms as f64);
        }
        if duration == 0 {
            self.flags.was_stopped = true;
            return StopOutcome::Immediate;
        }

        self.flags.was_pre_stopped = true;
        match self.start_fade(FadeKind::PlayStop, 0.0, duration, fade.curve, ctx) {
            FadeStart::Running => StopOutcome::Fading,
            FadeStart::Done => {
                self.flags.was_stopped = true;
                StopOutcome::Immediate
            }
        }
    }

    /// Nested pause; only the first level silences.
    ///
    /// Returns `true` when the voice actually paused.
    pub fn pause(&mut self, fade: TransitionSpec, ctx: &mut PbiCtx<'_>) -> bool {
        self.pause_count += 1;
        if self.pause_count > 1 {
            return false;
        }
        self.flags.was_paused = true;
        self.notify(ctx.sink, NotificationReason::Paused, 0.0);

        if !self.connected {
            if self.init_state == InitState::Playing {
                self.init_state = InitState::Paused;
            }
            self.hold_play_fade(true, ctx);
            return true;
        }
        if let FadeStart::Done =
            self.start_fade(FadeKind::PauseResume, 0.0, fade.samples(&ctx.time), fade.curve, ctx)
        {
            self.settle_paused(ctx);
        }
        true
    }

    /// Undo one pause level, or all of them for a master resume.
    ///
    /// Returns `true` when the voice actually resumed.
    pub fn resume(&mut self, fade: TransitionSpec, master: bool, ctx: &mut PbiCtx<'_>) -> bool {
        if self.pause_count == 0 {
            return false;
        }
        self.pause_count = if master { 0 } else { self.pause_count - 1 };
        if self.pause_count > 0 {
            return false;
        }
        self.flags.was_paused = false;
        self.hold_play_fade(false, ctx);

        if !self.connected {
            if self.init_state == InitState::Paused {
                self.init_state = InitState::Playing;
            }
            self.notify(ctx.sink, NotificationReason::Resumed, 0.0);
            return true;
        }

        if self.pause_fade.is_some_and(|id| ctx.transitions.contains(id)) {
            self.notify(ctx.sink, NotificationReason::PauseAborted, self.pause_resume_ratio);
        }
        if self.lower_paused {
            self.push(ctx, LowerCommandKind::Resume);
            self.lower_paused = false;
        }
        self.start_fade(FadeKind::PauseResume, 1.0, fade.samples(&ctx.time), fade.curve, ctx);
        self.notify(ctx.sink, NotificationReason::Resumed, 0.0);
        true
    }

    /// Finish the current loop and end.
    ///
    /// When `destroyed` names a node that is going away, continuation entries
    /// targeting it are dropped as well.
    pub fn play_to_end(&mut self, destroyed: Option<NodeId>, ctx: &mut PbiCtx<'_>) {
        self.loop_count = 1;
        if self.connected {
            self.push(ctx, LowerCommandKind::StopLooping);
        }
        if let Some(node) = destroyed {
            self.forget_node(node);
        }
    }

    /// Drop continuation entries that refer to `node`
    pub fn forget_node(&mut self, node: NodeId) {
        let Some(chain) = self.chain.as_mut() else {
            return;
        };
        chain.list.remove_node(node);
        if chain.next.as_ref().is_some_and(|n| n.node == node || n.list.innermost_container() == Some(node)) {
            self.drop_next();
        }
    }

    /// Forget the precomputed next element, scheduled or not
    pub fn drop_next(&mut self) {
        if let Some(chain) = self.chain.as_mut() {
            chain.next = None;
            chain.scheduled = false;
        }
    }

    /// Play to end and refuse any further continuation
    pub fn break_chain(&mut self, ctx: &mut PbiCtx<'_>) {
        self.play_to_end(None, ctx);
        if let Some(chain) = self.chain.as_mut() {
            chain.list = ContinuationList::new();
            chain.next = None;
        }
    }

    /// Seek now, or when the source connects
    pub fn seek_to(&mut self, position: SeekPosition, ctx: &mut PbiCtx<'_>) {
        if self.connected {
            self.push(ctx, LowerCommandKind::Seek(position));
        } else {
            self.seek = Some(position);
        }
    }

    /// Called by the lower engine once the source started
    pub fn on_connected(&mut self, started_paused: bool) {
        self.connected = true;
        self.lower_paused = started_paused;
        self.seek = None;
    }

    /// Release every transition still driving this voice.
    ///
    /// Each removal is reported as an aborted fade.
    pub fn release_transitions(&mut self, ctx: &mut PbiCtx<'_>) -> usize {
        let id = self.id;
        let removed = ctx.transitions.remove_users_where(|u| u.pbi() == Some(id));
        for _ in &removed {
            self.notify(ctx.sink, NotificationReason::FadeAborted, 0.0);
        }
        self.play_stop_fade = None;
        self.pause_fade = None;
        removed.len()
    }

    /// Drop the locked media
    pub fn release_media(&mut self) -> Option<MediaData> {
        self.media.take()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VOICE REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Active voices, iterated in creation order
#[derive(Debug, Default)]
pub struct VoiceRegistry {
    voices: BTreeMap<PbiId, Pbi>,
    next_id: u64,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> PbiId {
        self.next_id += 1;
        PbiId(self.next_id)
    }

    pub fn insert(&mut self, pbi: Pbi) {
        self.voices.insert(pbi.id, pbi);
    }

    #[inline]
    pub fn get(&self, id: PbiId) -> Option<&Pbi> {
        self.voices.get(&id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: PbiId) -> Option<&mut Pbi> {
        self.voices.get_mut(&id)
    }

    pub fn remove(&mut self, id: PbiId) -> Option<Pbi> {
        self.voices.remove(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.voices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Snapshot of ids; safe to mutate the registry while walking it
    pub fn ids(&self) -> Vec<PbiId> {
        self.voices.keys().copied().collect()
    }

    /// Ids of voices matching `pred`
    pub fn ids_where(&self, pred: impl Fn(&Pbi) -> bool) -> Vec<PbiId> {
        self.voices
            .values()
            .filter(|p| pred(p))
            .map(|p| p.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pbi> {
        self.voices.values()
    }

    pub fn virtual_count(&self) -> usize {
        self.voices.values().filter(|p| p.flags.is_virtual).count()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use vox_event::{ChannelSink, Notification};

    struct Harness {
        tm: TransitionManager,
        commands: Vec<LowerCommand>,
        sink: ChannelSink,
        rx: crossbeam_channel::Receiver<Notification>,
    }

    impl Harness {
        fn new() -> Self {
            let (sink, rx) = ChannelSink::unbounded();
            Self {
                tm: TransitionManager::new(16, 16),
                commands: Vec::new(),
                sink,
                rx,
            }
        }

        fn ctx(&mut self) -> PbiCtx<'_> {
            PbiCtx {
                transitions: &mut self.tm,
                commands: &mut self.commands,
                sink: &self.sink,
                time: TimeBase::new(48000, 480),
                min_stop_fade_ms: 1.0,
            }
        }

        fn reasons(&self) -> Vec<NotificationReason> {
            self.rx.try_iter().map(|n| n.reason).collect()
        }

        /// Run transitions, feeding updates back to the voice
        fn advance(&mut self, pbi: &mut Pbi, frames: u64) -> Vec<FadeEvent> {
            let updates = self.tm.process(frames);
            let mut events = Vec::new();
            for u in updates {
                if let TransitionUser::Voice { kind, .. } = u.user {
                    let mut ctx = self.ctx();
                    events.push(pbi.on_fade(kind, u.value, u.terminated, &mut ctx));
                }
            }
            events
        }
    }

    fn connected_pbi() -> Pbi {
        let mut pbi = Pbi::new(PbiId(1), NodeId(10), 1, 100);
        pbi.on_connected(false);
        pbi
    }

    #[test]
    fn test_play_queues_lower_command() {
        let mut h = Harness::new();
        let mut pbi = Pbi::new(PbiId(1), NodeId(10), 1, 100).with_sequence(4);
        pbi.play(TransitionSpec::NONE, NotificationReason::Play, &mut h.ctx());
        assert_eq!(h.commands.len(), 1);
        assert_eq!(h.commands[0].kind, LowerCommandKind::Play);
        assert_eq!(h.commands[0].seq, 4);
        assert_eq!(pbi.play_stop_ratio(), 1.0);
        assert_eq!(h.reasons(), vec![NotificationReason::Play]);
    }

    #[test]
    fn test_stop_before_connect_is_immediate() {
        let mut h = Harness::new();
        let mut pbi = Pbi::new(PbiId(1), NodeId(10), 1, 100);
        pbi.play(TransitionSpec::NONE, NotificationReason::Play, &mut h.ctx());
        let out = pbi.stop(TransitionSpec::new(500.0, FadeCurve::Linear), true, &mut h.ctx());
        assert_eq!(out, StopOutcome::Immediate);
        assert_eq!(pbi.init_state, InitState::Stopped);
        assert!(pbi.flags.was_stopped);
        assert!(h.tm.is_empty());
    }

    #[test]
    fn test_duplicate_stop_is_noop() {
        let mut h = Harness::new();
        let mut pbi = connected_pbi();
        let fade = TransitionSpec::new(100.0, FadeCurve::Linear);
        assert_eq!(pbi.stop(fade, true, &mut h.ctx()), StopOutcome::Fading);
        assert_eq!(pbi.stop(fade, true, &mut h.ctx()), StopOutcome::AlreadyStopping);
        assert_eq!(h.tm.len(), 1);

        let events = h.advance(&mut pbi, 4800);
        assert_eq!(events, vec![FadeEvent::StopReached]);
        assert!(pbi.flags.was_stopped);
        assert_eq!(pbi.play_stop_ratio(), 0.0);
    }

    #[test]
    fn test_zero_stop_uses_min_fade() {
        let mut h = Harness::new();
        let mut pbi = connected_pbi();
        assert_eq!(pbi.stop(TransitionSpec::NONE, true, &mut h.ctx()), StopOutcome::Fading);
        // 1 ms at 48 kHz
        assert_eq!(h.advance(&mut pbi, 48), vec![FadeEvent::StopReached]);

        let mut pbi = Pbi::new(PbiId(2), NodeId(10), 1, 100);
        pbi.on_connected(false);
        assert_eq!(pbi.stop(TransitionSpec::NONE, false, &mut h.ctx()), StopOutcome::Immediate);
    }

    #[test]
    fn test_stop_reverses_fade_in() {
        let mut h = Harness::new();
        let mut pbi = Pbi::new(PbiId(1), NodeId(10), 1, 100);
        pbi.play(TransitionSpec::new(100.0, FadeCurve::Linear), NotificationReason::Play, &mut h.ctx());
        pbi.on_connected(false);
        h.advance(&mut pbi, 2400);
        assert!((pbi.play_stop_ratio() - 0.5).abs() < 1e-4);

        assert_eq!(
            pbi.stop(TransitionSpec::new(100.0, FadeCurve::Linear), true, &mut h.ctx()),
            StopOutcome::Fading
        );
        assert_eq!(h.tm.len(), 1, "the running fade is re-targeted, not duplicated");
        // Half of the fade was travelled, so going back takes half as long
        assert_eq!(h.advance(&mut pbi, 2400), vec![FadeEvent::StopReached]);
    }

    #[test]
    fn test_stop_while_paused_is_immediate() {
        let mut h = Harness::new();
        let mut pbi = connected_pbi();
        assert!(pbi.pause(TransitionSpec::NONE, &mut h.ctx()));
        assert!(pbi.is_lower_paused());
        assert_eq!(
            pbi.stop(TransitionSpec::new(100.0, FadeCurve::Linear), true, &mut h.ctx()),
            StopOutcome::Immediate
        );
    }

    #[test]
    fn test_nested_pause_round_trip() {
        let mut h = Harness::new();
        let mut pbi = connected_pbi();
        let fade = TransitionSpec::new(50.0, FadeCurve::Sine);

        for i in 0..3 {
            assert_eq!(pbi.pause(fade, &mut h.ctx()), i == 0);
        }
        h.advance(&mut pbi, 4800);
        assert_eq!(pbi.pause_resume_ratio(), 0.0);
        assert!(pbi.is_lower_paused());

        assert!(!pbi.resume(fade, false, &mut h.ctx()));
        assert!(!pbi.resume(fade, false, &mut h.ctx()));
        assert!(pbi.is_paused());
        assert!(pbi.resume(fade, false, &mut h.ctx()));
        assert!(!pbi.is_lower_paused());
        h.advance(&mut pbi, 4800);
        assert_eq!(pbi.pause_resume_ratio(), 1.0);
        assert!(h.tm.is_empty());

        let kinds: Vec<_> = h.commands.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![LowerCommandKind::Pause, LowerCommandKind::Resume]);
    }

    #[test]
    fn test_master_resume_clears_count() {
        let mut h = Harness::new();
        let mut pbi = connected_pbi();
        pbi.pause(TransitionSpec::NONE, &mut h.ctx());
        pbi.pause(TransitionSpec::NONE, &mut h.ctx());
        assert!(pbi.resume(TransitionSpec::NONE, true, &mut h.ctx()));
        assert_eq!(pbi.pause_count(), 0);
        assert_eq!(pbi.pause_resume_ratio(), 1.0);
    }

    #[test]
    fn test_resume_during_pause_fade_aborts_pause() {
        let mut h = Harness::new();
        let mut pbi = connected_pbi();
        let fade = TransitionSpec::new(100.0, FadeCurve::Linear);
        pbi.pause(fade, &mut h.ctx());
        h.advance(&mut pbi, 2400);
        h.reasons();

        pbi.resume(fade, false, &mut h.ctx());
        let reasons = h.reasons();
        assert!(reasons.contains(&NotificationReason::PauseAborted));
        assert!(reasons.contains(&NotificationReason::Resumed));
        assert!(!pbi.is_lower_paused(), "never reached silence, never paused below");
    }

    #[test]
    fn test_pause_freezes_fade_in() {
        let mut h = Harness::new();
        let mut pbi = Pbi::new(PbiId(1), NodeId(10), 1, 100);
        pbi.play(TransitionSpec::new(100.0, FadeCurve::Linear), NotificationReason::Play, &mut h.ctx());
        pbi.on_connected(false);
        h.advance(&mut pbi, 960);
        assert!((pbi.play_stop_ratio() - 0.2).abs() < 1e-4);

        pbi.pause(TransitionSpec::NONE, &mut h.ctx());
        h.advance(&mut pbi, 9600);
        assert!((pbi.play_stop_ratio() - 0.2).abs() < 1e-4);

        pbi.resume(TransitionSpec::NONE, false, &mut h.ctx());
        h.advance(&mut pbi, 4800);
        assert_eq!(pbi.play_stop_ratio(), 1.0);
        assert!(h.tm.is_empty());
    }

    #[test]
    fn test_pause_before_connect_sets_init_state() {
        let mut h = Harness::new();
        let mut pbi = Pbi::new(PbiId(1), NodeId(10), 1, 100);
        pbi.pause(TransitionSpec::NONE, &mut h.ctx());
        assert_eq!(pbi.init_state, InitState::Paused);
        pbi.play(TransitionSpec::NONE, NotificationReason::Play, &mut h.ctx());
        assert_eq!(h.commands[0].kind, LowerCommandKind::PlayPause);
    }

    #[test]
    fn test_release_transitions_posts_fade_aborted() {
        let mut h = Harness::new();
        let mut pbi = connected_pbi();
        pbi.stop(TransitionSpec::new(100.0, FadeCurve::Linear), false, &mut h.ctx());
        h.reasons();
        assert_eq!(pbi.release_transitions(&mut h.ctx()), 1);
        assert_eq!(h.reasons(), vec![NotificationReason::FadeAborted]);
        assert!(h.tm.is_empty());
    }

    #[test]
    fn test_play_to_end_trims_chain() {
        let mut h = Harness::new();
        let mut list = ContinuationList::for_container(NodeId(50));
        list.items.push(crate::continuation::ContinuationItem::Container(NodeId(60)));
        let mut pbi = connected_pbi().with_chain(ChainState::new(PlayHistory::new(), list));
        pbi.loop_count = 0;

        pbi.play_to_end(Some(NodeId(60)), &mut h.ctx());
        assert_eq!(pbi.loop_count, 1);
        assert_eq!(h.commands[0].kind, LowerCommandKind::StopLooping);
        let chain = pbi.chain.as_ref().unwrap();
        assert_eq!(chain.list.innermost_container(), Some(NodeId(50)));

        pbi.break_chain(&mut h.ctx());
        assert!(pbi.chain.as_ref().unwrap().list.is_empty());
    }

    #[test]
    fn test_priority_clamped() {
        let mut pbi = Pbi::new(PbiId(1), NodeId(1), 1, 1).with_priority(90.0);
        pbi.distance_offset = 30.0;
        assert_eq!(pbi.priority(), 100.0);
        pbi.distance_offset = -120.0;
        assert_eq!(pbi.priority(), 0.0);
    }
}
