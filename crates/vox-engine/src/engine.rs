//! Audio Engine context
//!
//! Owns every piece of runtime state the audio thread touches and runs one
//! frame per [`AudioEngine::tick`]:
//!
//! ```text
//!   ┌────────────── tick ──────────────────────────────────────────────┐
//!   │ 1. drain command ring      → execute now, or defer (delay > 0)    │
//!   │ 2. pending actions due     → execute (DelayEnded)                 │
//!   │ 3. RTPC interpolation                                             │
//!   │ 4. limiters                → virtualize / kill                    │
//!   │ 5. lower engine            → create Cbx, start ready groups       │
//!   │ 6. transitions             → voice fades, ducks, SIS, states      │
//!   │ 7. mixing graph rebuild    (hierarchy generation moved)           │
//!   │ 8. resolve params + render → output buffer                        │
//!   │ 9. terminations            → counts, ducking, continuation        │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here is global: the engine is built with [`AudioEngine::new`],
//! brought up with [`AudioEngine::init`] and torn down with
//! [`AudioEngine::term`]. Voices are always walked over an id snapshot, so a
//! voice terminating while an action is being applied never invalidates the
//! iteration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use vox_core::{
    EngineConfig, GameObjectId, INVALID_GAME_OBJECT, INVALID_PLAYING_ID, NodeId, PlayingId,
    SILENCE_DB, SequenceId, Tick, TimeBase, VoxError, VoxResult, db_to_gain,
    generate_playing_id,
};
use vox_event::{
    Action, ActionRecord, ActionScope, ActionType, CommandReader, GameSyncs, NotificationReason,
    NotificationSink, PendingAction, PendingActionList, PendingFilter, TransitionSpec,
};

use crate::containers::{ContainerSelector, ContainerStates, ContinuousTransition};
use crate::continuation::{
    ChildKind, ContinuationList, ContinuationSource, NextDecision, NextTiming, PlayHistory,
    crossfade_plan, next_decision,
};
use crate::ducking::{DuckCtx, DuckOutcome, DuckingEngine, apply_duck};
use crate::hierarchy::Hierarchy;
use crate::limiter::{KickReason, LimiterRegistry, LimiterScope, LimiterVerdict};
use crate::loader::{HierarchyLoader, LoadReport};
use crate::lower::{CodecRegistry, LowerEngine, LowerEvent, NO_SEQUENCE};
use crate::pbi::{ChainState, FadeEvent, NextElement, Pbi, PbiCtx, PbiId, StopOutcome, VoiceRegistry};
use crate::props::PropId;
use crate::resolve::{ResolveCtx, RouteCache, bus_params, voice_params};
use crate::stats::{EngineStats, SharedStats};
use crate::transition::{AddOutcome, TransitionManager, TransitionParams, TransitionUpdate, TransitionUser};

/// Deepest container nesting expanded for one play
const MAX_PLAY_EXPANSION: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════════
// PENDING PAYLOAD
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a deferred continuation needs to start the next element
#[derive(Debug, Clone, PartialEq)]
pub struct ChainHandoff {
    pub element: NextElement,
    pub pause_count: u32,
    pub instigator: Option<NodeId>,
    pub transition: ContinuousTransition,
    pub transition_ms: f32,
    /// Fade-in of the next element (and fade-out of `previous`)
    pub fade: TransitionSpec,
    /// Voice to fade out when the next element starts
    pub previous: Option<PbiId>,
}

/// Engine data attached to a pending action
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingExtra {
    pub chain: Option<Box<ChainHandoff>>,
}

/// One action ready to run
struct Dispatch {
    action: Arc<Action>,
    game_object: GameObjectId,
    playing_id: PlayingId,
    custom_param: u64,
    frame_offset: u32,
    seq: SequenceId,
    extra: PendingExtra,
}

impl Dispatch {
    fn from_record(record: ActionRecord) -> Self {
        Self {
            action: Arc::new(record.action),
            game_object: record.game_object,
            playing_id: record.playing_id,
            custom_param: record.custom_param,
            frame_offset: 0,
            seq: NO_SEQUENCE,
            extra: PendingExtra::default(),
        }
    }

    fn from_pending(pa: PendingAction<PendingExtra>) -> Self {
        Self {
            action: pa.action,
            game_object: pa.game_object,
            playing_id: pa.playing_id,
            custom_param: pa.custom_param,
            frame_offset: pa.launch.frame_offset,
            seq: NO_SEQUENCE,
            extra: pa.extra,
        }
    }

    fn scoped_game_object(&self) -> Option<GameObjectId> {
        match self.action.scope {
            ActionScope::Global => None,
            ActionScope::GameObject if self.game_object == INVALID_GAME_OBJECT => None,
            ActionScope::GameObject => Some(self.game_object),
        }
    }

    fn filter(&self) -> PendingFilter {
        PendingFilter {
            node: (!self.action.target.is_none()).then_some(self.action.target),
            game_object: self.scoped_game_object(),
            playing_id: (self.playing_id != INVALID_PLAYING_ID).then_some(self.playing_id),
        }
    }

    fn post(&self, sink: &dyn NotificationSink, reason: NotificationReason, extra: f32) {
        sink.post_notification(
            reason,
            self.playing_id,
            self.game_object,
            self.custom_param,
            self.action.target,
            extra,
        );
    }
}

/// Parameters of one voice about to be created
#[derive(Debug, Clone)]
struct VoiceRequest {
    game_object: GameObjectId,
    playing_id: PlayingId,
    custom_param: u64,
    fade: TransitionSpec,
    reason: NotificationReason,
    frame_offset: u32,
    seq: SequenceId,
    chain: Option<ChainState>,
    pause_count: u32,
    instigator: Option<NodeId>,
}

/// Why a voice is being terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermCause {
    Stopped,
    EndReached,
    PlayFailed,
    SourceFailed,
    Kicked(KickReason),
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct AudioEngine {
    config: EngineConfig,
    time: TimeBase,
    now: Tick,
    initialized: bool,

    hierarchy: Hierarchy,
    syncs: GameSyncs,
    container_states: ContainerStates,
    route_cache: RouteCache,

    voices: VoiceRegistry,
    pending: PendingActionList<PendingExtra>,
    transitions: TransitionManager,
    limiters: LimiterRegistry,
    ducking: DuckingEngine,
    lower: LowerEngine,

    reader: Option<CommandReader>,
    sink: Arc<dyn NotificationSink>,
    /// Lower commands produced since the last hand-off
    commands: Vec<crate::lower::LowerCommand>,
    terminating: Vec<(PbiId, TermCause)>,
    /// Voices faded out to make room for their continuation
    handed_off: HashSet<PbiId>,
    next_seq: SequenceId,

    shared_stats: Arc<SharedStats>,
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("now", &self.now)
            .field("initialized", &self.initialized)
            .field("voices", &self.voices.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl AudioEngine {
    pub fn new(config: EngineConfig, sink: Arc<dyn NotificationSink>) -> VoxResult<Self> {
        config.validate()?;
        let time = config.time_base();
        let lower = LowerEngine::new(
            CodecRegistry::with_builtin(),
            config.output_channels,
            config.frames_per_tick,
        )
        .with_parallel(config.parallel_voices);

        Ok(Self {
            time,
            now: 0,
            initialized: false,
            hierarchy: Hierarchy::new(),
            syncs: GameSyncs::new(),
            container_states: ContainerStates::new(config.random_seed),
            route_cache: RouteCache::new(),
            voices: VoiceRegistry::new(),
            pending: PendingActionList::new(config.max_pending_actions),
            transitions: TransitionManager::new(
                config.max_fade_transitions,
                config.max_state_transitions,
            ),
            limiters: LimiterRegistry::new(
                config.max_voices,
                config.global_kill_policy,
                config.limiter_arbitration,
            ),
            ducking: DuckingEngine::new(),
            lower,
            reader: None,
            sink,
            commands: Vec::new(),
            terminating: Vec::new(),
            handed_off: HashSet::new(),
            next_seq: NO_SEQUENCE,
            shared_stats: Arc::new(SharedStats::new()),
            config,
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ───────────────────────────────────────────────────────────────────────

    pub fn init(&mut self) -> VoxResult<()> {
        if self.initialized {
            return Err(VoxError::AlreadyInitialized);
        }
        self.initialized = true;
        log::info!(
            "AudioEngine: initialized ({} Hz, {} frames/tick, {} channels)",
            self.time.sample_rate,
            self.time.frames_per_tick,
            self.config.output_channels
        );
        Ok(())
    }

    /// Stop every voice, drop every deferred action and go back to the
    /// uninitialized state
    pub fn term(&mut self) -> VoxResult<()> {
        if !self.initialized {
            return Err(VoxError::NotInitialized);
        }
        for pa in self.pending.flush() {
            if !pa.action_type().is_internal() && pa.extra.chain.is_none() {
                Dispatch::from_pending(pa).post(self.sink.as_ref(), NotificationReason::DelayAborted, 0.0);
            }
        }
        for id in self.voices.ids() {
            if let Some(p) = self.voices.get_mut(id) {
                p.chain = None;
            }
            self.terminating.push((id, TermCause::Stopped));
        }
        self.run_terminations();
        self.pending.flush();
        // Ducks, SIS and state ramps land on their targets
        for id in self.transitions.ids() {
            let updates = self.transitions.terminate(id);
            self.apply_transition_updates(updates);
        }
        self.run_terminations();
        self.initialized = false;
        self.publish_stats();
        log::info!("AudioEngine: terminated after {} ticks", self.now);
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Consume actions from a command ring on every tick
    pub fn attach_queue(&mut self, reader: CommandReader) {
        self.reader = Some(reader);
    }

    // ───────────────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────────────

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn time_base(&self) -> TimeBase {
        self.time
    }

    /// Current tick
    #[inline]
    pub fn now(&self) -> Tick {
        self.now
    }

    #[inline]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Structural access; callers on other threads hold the engine lock
    #[inline]
    pub fn hierarchy_mut(&mut self) -> &mut Hierarchy {
        &mut self.hierarchy
    }

    #[inline]
    pub fn syncs(&self) -> &GameSyncs {
        &self.syncs
    }

    #[inline]
    pub fn syncs_mut(&mut self) -> &mut GameSyncs {
        &mut self.syncs
    }

    #[inline]
    pub fn codecs_mut(&mut self) -> &mut CodecRegistry {
        self.lower.codecs_mut()
    }

    #[inline]
    pub fn voices(&self) -> &VoiceRegistry {
        &self.voices
    }

    #[inline]
    pub fn voice(&self, id: PbiId) -> Option<&Pbi> {
        self.voices.get(id)
    }

    /// Voices belonging to a playing id
    pub fn voices_of(&self, playing_id: PlayingId) -> Vec<PbiId> {
        self.voices.ids_where(|p| p.playing_id == playing_id)
    }

    #[inline]
    pub fn pending(&self) -> &PendingActionList<PendingExtra> {
        &self.pending
    }

    #[inline]
    pub fn transitions(&self) -> &TransitionManager {
        &self.transitions
    }

    #[inline]
    pub fn lower(&self) -> &LowerEngine {
        &self.lower
    }

    /// Mixed output of the last tick, interleaved
    #[inline]
    pub fn output(&self) -> &[f32] {
        self.lower.output()
    }

    pub fn shared_stats(&self) -> Arc<SharedStats> {
        Arc::clone(&self.shared_stats)
    }

    pub fn stats(&self) -> EngineStats {
        let t = self.transitions.stats();
        let lower = self.lower.stats();
        EngineStats {
            tick: self.now,
            active_voices: self.voices.len(),
            virtual_voices: self.voices.virtual_count(),
            pending_actions: self.pending.len(),
            fade_transitions: t.fade_in_use,
            state_transitions: t.state_in_use,
            fade_transitions_peak: t.fade_peak,
            state_transitions_peak: t.state_peak,
            graph_rebuilds: self.lower.graph().rebuild_count(),
            has_cycles: self.lower.graph().has_cycles(),
            last_bank_unloaded: self.hierarchy.last_bank_unloaded(),
            rejected_commands: self.reader.as_ref().map_or(0, |r| r.rejected_count()),
            sources_started: lower.sources_started,
            play_failed: lower.play_failed,
            groups_deferred: lower.groups_deferred,
            purged_commands: lower.purged,
        }
    }

    fn publish_stats(&self) {
        self.shared_stats.publish(&self.stats());
    }

    /// Read node parameter blocks into the hierarchy
    pub fn load_bank(&mut self, bytes: &[u8]) -> LoadReport {
        let report = HierarchyLoader::load_nodes(&mut self.hierarchy, bytes);
        if !report.is_clean() {
            log::error!("AudioEngine: {} node(s) failed to load", report.failed.len());
        }
        report
    }

    /// Release the engine's hold on a node.
    ///
    /// Voices under it finish their current loop and will not continue into
    /// it. Deferred actions resolving against it are aborted, continuations
    /// included. The node is destroyed once the last voice holding it ends.
    /// Returns `false` for an unknown node.
    pub fn remove_node(&mut self, node: NodeId) -> bool {
        if !self.hierarchy.contains(node) {
            return false;
        }
        let hierarchy = &self.hierarchy;
        let under = |id: NodeId| hierarchy.node_chain(id).contains(&node);
        let aborted = self.pending.clear_where(|pa| {
            if pa.action_type().is_internal() {
                return false;
            }
            under(pa.target)
                || pa
                    .extra
                    .chain
                    .as_ref()
                    .is_some_and(|c| c.element.list.innermost_container() == Some(node))
        });

        // (voice, plays under the node, its next element does)
        let affected: Vec<(PbiId, bool, bool)> = self
            .voices
            .iter()
            .filter_map(|p| {
                let next_gone = p
                    .chain
                    .as_ref()
                    .and_then(|c| c.next.as_ref())
                    .is_some_and(|n| under(n.node));
                let playing = under(p.node);
                (playing || p.chain.is_some()).then_some((p.id, playing, next_gone))
            })
            .collect();
        log::debug!(
            "AudioEngine: removing {} ({} voice(s) affected, {} pending aborted)",
            node,
            affected.len(),
            aborted.len()
        );
        self.post_aborted(aborted);

        {
            let (voices, mut ctx) = self.voices_and_ctx();
            for (id, playing, next_gone) in affected {
                let Some(p) = voices.get_mut(id) else {
                    continue;
                };
                if playing {
                    p.play_to_end(Some(node), &mut ctx);
                } else {
                    p.forget_node(node);
                }
                if next_gone {
                    p.drop_next();
                }
            }
        }
        self.flush_commands();

        if self.hierarchy.release(node) {
            log::info!("AudioEngine: {} destroyed", node);
        }
        true
    }

    /// Forget every per-object setting of `game_object`
    pub fn unregister_game_object(&mut self, game_object: GameObjectId) {
        self.syncs.unregister_game_object(game_object);
        self.hierarchy.unregister_game_object(game_object);
        self.container_states.remove_game_object(game_object);
    }

    /// Allocate a sample-accurate group id for plays that must start together
    pub fn new_sequence(&mut self) -> SequenceId {
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        self.next_seq
    }

    // ───────────────────────────────────────────────────────────────────────
    // Borrow helpers
    // ───────────────────────────────────────────────────────────────────────

    fn voices_and_ctx(&mut self) -> (&mut VoiceRegistry, PbiCtx<'_>) {
        (
            &mut self.voices,
            PbiCtx {
                transitions: &mut self.transitions,
                commands: &mut self.commands,
                sink: self.sink.as_ref(),
                time: self.time,
                min_stop_fade_ms: self.config.min_stop_fade_ms,
            },
        )
    }

    fn duck_ctx(&mut self) -> DuckCtx<'_> {
        DuckCtx {
            hierarchy: &mut self.hierarchy,
            transitions: &mut self.transitions,
            sink: self.sink.as_ref(),
            time: self.time,
        }
    }

    fn flush_commands(&mut self) {
        if !self.commands.is_empty() {
            let commands = std::mem::take(&mut self.commands);
            self.lower.enqueue(commands);
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Posting
    // ───────────────────────────────────────────────────────────────────────

    /// Play `node` on `game_object` now; returns the new playing id
    pub fn play(&mut self, node: NodeId, game_object: GameObjectId) -> PlayingId {
        let playing_id = generate_playing_id();
        self.post(ActionRecord::new(Action::play(node), game_object, playing_id));
        playing_id
    }

    /// Play several nodes so that they start in the same frame or not at all
    pub fn play_group(&mut self, nodes: &[NodeId], game_object: GameObjectId) -> PlayingId {
        let playing_id = generate_playing_id();
        let seq = self.new_sequence();
        for node in nodes {
            let mut d = Dispatch::from_record(ActionRecord::new(Action::play(*node), game_object, playing_id));
            d.seq = seq;
            self.execute(d);
        }
        self.flush_commands();
        playing_id
    }

    /// Execute an action now, or defer it when it carries a delay
    pub fn post(&mut self, mut record: ActionRecord) {
        if record.action.action_type.is_play_action() && record.playing_id == INVALID_PLAYING_ID {
            record.playing_id = generate_playing_id();
        }
        let delay = record.action.delay_samples(&self.time);
        if delay == 0 {
            self.execute(Dispatch::from_record(record));
            self.flush_commands();
            return;
        }

        let launch = self.time.delay_from(self.now, delay);
        let delay_ms = record.action.delay_ms;
        let pa = PendingAction::new(
            Arc::new(record.action),
            record.game_object,
            record.playing_id,
            launch,
            PendingExtra::default(),
        )
        .with_custom_param(record.custom_param);
        let notify = (!pa.action_type().is_internal())
            .then_some((pa.playing_id, pa.game_object, pa.custom_param, pa.target));

        match self.pending.insert(pa) {
            Ok(()) => {
                if let Some((pid, go, custom, target)) = notify {
                    self.sink.post_notification(
                        NotificationReason::DelayStarted,
                        pid,
                        go,
                        custom,
                        target,
                        delay_ms,
                    );
                }
            }
            Err(e) => log::warn!("AudioEngine: action dropped ({})", e),
        }
    }

    fn drain_commands(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let mut records = Vec::new();
        reader.drain(|tag, payload| match ActionRecord::decode(tag, payload) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("AudioEngine: undecodable command (tag {}): {}", tag, e),
        });
        for record in records {
            self.post(record);
        }
    }

    fn process_pending(&mut self) {
        for pa in self.pending.process_due(self.now) {
            let visible = !pa.action_type().is_internal() && pa.extra.chain.is_none();
            let dispatch = Dispatch::from_pending(pa);
            if visible {
                dispatch.post(self.sink.as_ref(), NotificationReason::DelayEnded, 0.0);
            }
            self.execute(dispatch);
        }
        self.flush_commands();
    }

    fn post_aborted(&self, aborted: Vec<PendingAction<PendingExtra>>) {
        for pa in aborted {
            if pa.extra.chain.is_none() {
                Dispatch::from_pending(pa).post(self.sink.as_ref(), NotificationReason::DelayAborted, 0.0);
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Action execution
    // ───────────────────────────────────────────────────────────────────────

    fn execute(&mut self, d: Dispatch) {
        log::debug!(
            "AudioEngine: {} on {} (go {}, pid {})",
            d.action.action_type.display_name(),
            d.action.target,
            d.game_object,
            d.playing_id
        );
        match d.action.action_type {
            ActionType::Play => self.execute_play(&d),
            ActionType::PlayAndContinue => self.execute_continue(d),
            ActionType::Stop => self.execute_stop(&d),
            ActionType::Pause => self.execute_pause(&d),
            ActionType::Resume => self.execute_resume(&d),
            ActionType::Break => self.execute_break(&d),
            ActionType::Mute => self.execute_mute(&d, true),
            ActionType::Unmute => self.execute_mute(&d, false),
            ActionType::Seek => self.execute_seek(&d),
            ActionType::SetRtpc => {
                let frames = d.action.transition.samples(&self.time);
                let go = d.scoped_game_object().unwrap_or(INVALID_GAME_OBJECT);
                self.syncs.set_rtpc(d.action.rtpc_id, d.action.rtpc_value, go, frames);
            }
            ActionType::ResetRtpc => {
                let frames = d.action.transition.samples(&self.time);
                let go = d.scoped_game_object().unwrap_or(INVALID_GAME_OBJECT);
                self.syncs.reset_rtpc(d.action.rtpc_id, go, frames);
            }
            ActionType::SetSwitch => {
                self.syncs
                    .set_switch(d.game_object, d.action.group_id, d.action.value_id);
            }
            ActionType::SetState => self.execute_set_state(&d),
            ActionType::DuckRecovery => {
                let ducking = self.ducking;
                let mut ctx = self.duck_ctx();
                ducking.on_recovery(d.action.target, &mut ctx);
            }
        }
    }

    /// Voices an action targets: by node (the node, an ancestor, its
    /// instigator or a bus it routes through), game object and playing id
    fn matching_voices(&self, d: &Dispatch) -> Vec<PbiId> {
        let go = d.scoped_game_object();
        let target = d.action.target;
        let pid = d.playing_id;
        let h = &self.hierarchy;
        self.voices.ids_where(|p| {
            go.is_none_or(|g| g == p.game_object)
                && (pid == INVALID_PLAYING_ID || p.playing_id == pid)
                && (target.is_none() || targets_voice(h, p, target))
        })
    }

    /// Expand a play target into the leaves to start, with chain state for
    /// leaves picked by a continuous container
    fn expand_play(&mut self, node: NodeId, game_object: GameObjectId) -> Vec<(NodeId, Option<ChainState>)> {
        let mut leaves = Vec::new();
        let mut work = vec![node];
        let mut selector = ContainerSelector::new(
            &self.hierarchy,
            &mut self.container_states,
            &self.syncs,
            game_object,
        );

        let mut steps = 0;
        while let Some(current) = work.pop() {
            steps += 1;
            if steps > MAX_PLAY_EXPANSION {
                log::warn!("AudioEngine: play of {} expands too deep", node);
                break;
            }
            match selector.child_kind(current) {
                ChildKind::Leaf => leaves.push((current, None)),
                ChildKind::Step => {
                    if let Some(child) = selector.select_step(current) {
                        work.push(child);
                    }
                }
                ChildKind::Switch => {
                    let mut targets = selector.switch_targets(current);
                    targets.reverse();
                    work.extend(targets);
                }
                ChildKind::Continuous => {
                    let decision = next_decision(
                        &PlayHistory::new(),
                        &ContinuationList::for_container(current),
                        &mut selector,
                    );
                    if let NextDecision::Next {
                        node,
                        also,
                        history,
                        list,
                    } = decision
                    {
                        leaves.push((node, Some(chain_for(selector.hierarchy, history, list))));
                        work.extend(also.into_iter().rev());
                    }
                }
            }
        }
        leaves
    }

    fn execute_play(&mut self, d: &Dispatch) {
        let target = d.action.target;
        let leaves = self.expand_play(target, d.game_object);
        if leaves.is_empty() {
            log::debug!("AudioEngine: {} selected nothing to play", target);
            d.post(self.sink.as_ref(), NotificationReason::PlayFailed, 0.0);
            return;
        }
        for (leaf, chain) in leaves {
            let request = VoiceRequest {
                game_object: d.game_object,
                playing_id: d.playing_id,
                custom_param: d.custom_param,
                fade: d.action.transition,
                reason: NotificationReason::Play,
                frame_offset: d.frame_offset,
                seq: d.seq,
                chain,
                pause_count: 0,
                instigator: Some(target),
            };
            self.create_voice(leaf, request);
        }
    }

    /// Start the element a chained voice handed over
    fn execute_continue(&mut self, d: Dispatch) {
        let Some(handoff) = d.extra.chain else {
            log::warn!("AudioEngine: continuation without chain data on {}", d.action.target);
            return;
        };
        let handoff = *handoff;

        if let Some(prev) = handoff.previous {
            if !handoff.fade.is_instant() {
                let (voices, mut ctx) = self.voices_and_ctx();
                let faded = voices
                    .get_mut(prev)
                    .map(|p| p.stop(handoff.fade, false, &mut ctx));
                match faded {
                    Some(StopOutcome::Immediate) => {
                        self.handed_off.insert(prev);
                        self.terminating.push((prev, TermCause::Stopped));
                    }
                    Some(StopOutcome::Fading) => {
                        self.handed_off.insert(prev);
                    }
                    Some(StopOutcome::AlreadyStopping) | None => {}
                }
            }
        }

        let NextElement {
            node,
            also,
            history,
            list,
        } = handoff.element;
        let chain = ChainState::new(history, list).with_transition(handoff.transition, handoff.transition_ms);
        let request = VoiceRequest {
            game_object: d.game_object,
            playing_id: d.playing_id,
            custom_param: d.custom_param,
            fade: handoff.fade,
            reason: NotificationReason::PlayContinue,
            frame_offset: d.frame_offset,
            seq: NO_SEQUENCE,
            chain: Some(chain),
            pause_count: handoff.pause_count,
            instigator: handoff.instigator,
        };
        self.create_voice(node, request.clone());

        for extra in also {
            let leaves = self.expand_play(extra, d.game_object);
            for (leaf, chain) in leaves {
                let mut request = request.clone();
                request.reason = NotificationReason::Play;
                request.chain = chain;
                self.create_voice(leaf, request);
            }
        }
    }

    /// Create a voice for a leaf node and issue its play
    fn create_voice(&mut self, node: NodeId, request: VoiceRequest) -> Option<PbiId> {
        let sound = self.hierarchy.node(node).and_then(|n| n.sound_data()).cloned();
        let Some(sound) = sound else {
            log::warn!("AudioEngine: {} is not a playable sound", node);
            self.sink.post_notification(
                NotificationReason::PlayFailed,
                request.playing_id,
                request.game_object,
                request.custom_param,
                node,
                0.0,
            );
            return None;
        };
        if let Err(e) = self.hierarchy.add_ref(node) {
            log::warn!("AudioEngine: cannot hold {}: {}", node, e);
            return None;
        }

        let id = self.voices.allocate_id();
        let ctx = ResolveCtx {
            syncs: &self.syncs,
            game_object: request.game_object,
            duck_floor_db: self.config.max_duck_attenuation_db,
        };
        let params = voice_params(&self.hierarchy, &mut self.route_cache, node, &ctx);

        let mut pbi = Pbi::new(id, node, request.game_object, request.playing_id)
            .with_custom_param(request.custom_param)
            .with_priority(params.values.get(PropId::Priority))
            .with_frame_offset(request.frame_offset)
            .with_sequence(request.seq);
        pbi.distance_offset = params.values.get(PropId::PriorityDistanceOffset);
        pbi.codec = sound.codec;
        pbi.source_type = sound.source_type;
        pbi.media = sound.media;
        pbi.loop_count = sound.loop_count;
        if let Some(chain) = request.chain {
            pbi = pbi.with_chain(chain);
        }
        if let Some(instigator) = request.instigator {
            pbi.set_instigator(instigator);
        }
        pbi.inherit_pause_count(request.pause_count);

        let scopes = self.limiter_scopes(node, request.game_object);
        pbi.limiters = self.limiters.register(id, pbi.priority(), &scopes);
        self.voices.insert(pbi);

        let (voices, mut ctx) = self.voices_and_ctx();
        if let Some(p) = voices.get_mut(id) {
            p.play(request.fade, request.reason, &mut ctx);
        }
        Some(id)
    }

    /// Limiters a voice of `node` falls under: every limited node above it
    /// and every limited bus it routes through
    fn limiter_scopes(&self, node: NodeId, game_object: GameObjectId) -> Vec<LimiterScope> {
        let h = &self.hierarchy;
        let mut chain = h.node_chain(node);
        if let Some(bus) = h.effective_output_bus(node) {
            chain.extend(h.bus_chain(bus));
        }
        chain
            .into_iter()
            .filter_map(|id| {
                let limit = h.node(id)?.limit?;
                (limit.max_instances > 0).then(|| LimiterScope::for_node(id, game_object, limit))
            })
            .collect()
    }

    fn execute_stop(&mut self, d: &Dispatch) {
        let aborted = self.pending.stop_pending(&d.filter());
        self.post_aborted(aborted);

        let ids = self.matching_voices(d);
        let mut immediate = Vec::new();
        let mut chained = Vec::new();
        {
            let (voices, mut ctx) = self.voices_and_ctx();
            for id in ids {
                let Some(p) = voices.get_mut(id) else {
                    continue;
                };
                if p.chain.as_ref().is_some_and(|c| c.scheduled) {
                    chained.push(p.playing_id);
                }
                if p.stop(d.action.transition, true, &mut ctx) == StopOutcome::Immediate {
                    immediate.push(id);
                }
            }
        }
        for pid in chained {
            self.pending.break_pending(&PendingFilter::by_playing_id(pid));
        }
        self.terminating
            .extend(immediate.into_iter().map(|id| (id, TermCause::Stopped)));
    }

    /// Pending continuations of the chained voices among `ids`
    fn chained_playing_ids(&self, ids: &[PbiId]) -> Vec<PlayingId> {
        let mut pids: Vec<PlayingId> = ids
            .iter()
            .filter_map(|id| self.voices.get(*id))
            .filter(|p| p.chain.as_ref().is_some_and(|c| c.scheduled))
            .map(|p| p.playing_id)
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    fn execute_pause(&mut self, d: &Dispatch) {
        let now = self.now;
        self.pending.pause(&d.filter(), now);
        let ids = self.matching_voices(d);
        for pid in self.chained_playing_ids(&ids) {
            self.pending.pause(&PendingFilter::by_playing_id(pid), now);
        }

        let (voices, mut ctx) = self.voices_and_ctx();
        for id in ids {
            if let Some(p) = voices.get_mut(id) {
                p.pause(d.action.transition, &mut ctx);
            }
        }
    }

    fn execute_resume(&mut self, d: &Dispatch) {
        let now = self.now;
        let master = d.action.is_master_resume;
        self.pending.resume(&d.filter(), master, now);
        let ids = self.matching_voices(d);
        for pid in self.chained_playing_ids(&ids) {
            self.pending.resume(&PendingFilter::by_playing_id(pid), master, now);
        }

        let (voices, mut ctx) = self.voices_and_ctx();
        for id in ids {
            if let Some(p) = voices.get_mut(id) {
                p.resume(d.action.transition, master, &mut ctx);
            }
        }
    }

    fn execute_break(&mut self, d: &Dispatch) {
        self.pending.break_pending(&d.filter());
        let ids = self.matching_voices(d);
        for pid in self.chained_playing_ids(&ids) {
            self.pending.break_pending(&PendingFilter::by_playing_id(pid));
        }

        let (voices, mut ctx) = self.voices_and_ctx();
        for id in ids {
            if let Some(p) = voices.get_mut(id) {
                p.break_chain(&mut ctx);
                if let Some(chain) = p.chain.as_mut() {
                    chain.scheduled = false;
                }
            }
        }
    }

    fn execute_seek(&mut self, d: &Dispatch) {
        let Some(position) = d.action.seek else {
            return;
        };
        let ids = self.matching_voices(d);
        let (voices, mut ctx) = self.voices_and_ctx();
        for id in ids {
            if let Some(p) = voices.get_mut(id) {
                p.seek_to(position, &mut ctx);
            }
        }
    }

    /// Mute ramps a scoped volume override down to silence; unmute ramps it back
    fn execute_mute(&mut self, d: &Dispatch, mute: bool) {
        let node = d.action.target;
        let game_object = d.scoped_game_object().unwrap_or(INVALID_GAME_OBJECT);
        let target = if mute { SILENCE_DB } else { 0.0 };
        let user = TransitionUser::Sis {
            node,
            game_object,
            prop: PropId::Volume,
        };
        let duration = d.action.transition.samples(&self.time);

        let running = self.transitions.find_user(user);
        let retargeted = running.is_some_and(|id| {
            duration > 0
                && self
                    .transitions
                    .change_parameter(id, target, duration, d.action.transition.curve)
                    .is_ok()
        });
        if !retargeted {
            if let Some(id) = running {
                self.transitions.remove_user(id, user);
            }
            let start = self.hierarchy.sis_value(node, game_object, PropId::Volume);
            let params = TransitionParams::new(start, target, duration, d.action.transition.curve);
            match self.transitions.add(params, user) {
                Ok(AddOutcome::Immediate(value)) => self.apply_sis(node, game_object, PropId::Volume, value, true),
                Ok(AddOutcome::Started(_)) => {}
                Err(e) => {
                    log::warn!("AudioEngine: mute fade on {} not started ({})", node, e);
                    self.apply_sis(node, game_object, PropId::Volume, target, true);
                }
            }
        }

        let reason = if mute {
            NotificationReason::Muted
        } else {
            NotificationReason::Unmuted
        };
        d.post(self.sink.as_ref(), reason, target);
    }

    fn apply_sis(&mut self, node: NodeId, game_object: GameObjectId, prop: PropId, value: f32, terminated: bool) {
        if terminated && value == 0.0 {
            self.hierarchy.clear_sis(node, game_object, prop);
        } else {
            self.hierarchy.set_sis(node, game_object, prop, value);
        }
    }

    /// Change a state and ramp every node's state offsets to the new state
    fn execute_set_state(&mut self, d: &Dispatch) {
        let group = d.action.group_id;
        let state = d.action.value_id;
        self.syncs.set_state(group, state);
        let transition_ms = self
            .syncs
            .state_group(group)
            .map_or(0.0, |g| g.transition_ms);
        let duration = self.time.ms_to_samples(transition_ms as f64);

        for node in self.hierarchy.nodes_with_state_group(group) {
            let targets: Vec<(PropId, f32)> = self
                .hierarchy
                .node(node)
                .map(|n| {
                    n.state_props
                        .iter()
                        .filter(|sp| sp.group_id == group)
                        .flat_map(|sp| sp.props().iter().map(move |prop| (prop, sp.value(state, prop))))
                        .collect()
                })
                .unwrap_or_default();

            for (prop, target) in targets {
                let user = TransitionUser::State { node, prop };
                if let Some(id) = self.transitions.find_user(user) {
                    self.transitions.remove_user(id, user);
                }
                let start = self.hierarchy.state_value(node, prop);
                let params = TransitionParams::new(start, target, duration, d.action.transition.curve);
                match self.transitions.add(params, user) {
                    Ok(AddOutcome::Immediate(value)) => self.hierarchy.set_state_value(node, prop, value),
                    Ok(AddOutcome::Started(_)) => {}
                    Err(_) => self.hierarchy.set_state_value(node, prop, target),
                }
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Frame processing
    // ───────────────────────────────────────────────────────────────────────

    /// Run one audio frame
    pub fn tick(&mut self) -> VoxResult<()> {
        if !self.initialized {
            return Err(VoxError::NotInitialized);
        }
        let frames = self.time.frames_per_tick as u64;

        self.drain_commands();
        self.process_pending();
        self.syncs.update(frames);
        self.run_terminations();

        self.update_limiters();
        self.run_terminations();
        self.flush_commands();

        let mut events = self.lower.process_play_commands(&self.voices);
        events.extend(self.lower.process_pending_commands(&mut self.voices));
        self.handle_lower_events(events);
        self.flush_commands();

        self.process_transitions();
        self.run_terminations();
        self.flush_commands();

        if self.lower.rebuild_graph_if_needed(&self.hierarchy) {
            log::debug!(
                "AudioEngine: mixing graph rebuilt at tick {} (generation {})",
                self.now,
                self.hierarchy.generation()
            );
        }
        let bus_gains = self.update_mix();
        let events = self.lower.render(&bus_gains);
        self.handle_lower_events(events);
        self.run_terminations();

        self.now += 1;
        self.publish_stats();
        Ok(())
    }

    fn update_limiters(&mut self) {
        let verdicts = self.limiters.update();
        let mut kills = Vec::new();
        for (id, verdict) in verdicts {
            let Some(p) = self.voices.get_mut(id) else {
                continue;
            };
            if p.flags.was_stopped {
                continue;
            }
            match verdict {
                LimiterVerdict::Audible => {
                    if p.flags.is_virtual {
                        p.flags.is_virtual = false;
                        log::debug!("{}: back from virtual", id);
                    }
                }
                LimiterVerdict::Virtual(_) => {
                    if !p.flags.is_virtual {
                        p.flags.is_virtual = true;
                        p.post(self.sink.as_ref(), NotificationReason::VirtualByLimit);
                    }
                }
                LimiterVerdict::Kill(reason) => {
                    p.flags.was_kicked = true;
                    p.flags.was_stopped = true;
                    kills.push((id, TermCause::Kicked(reason)));
                }
            }
        }
        if !kills.is_empty() {
            log::warn!("AudioEngine: {} voice(s) killed by limiters", kills.len());
        }
        self.terminating.extend(kills);
    }

    fn handle_lower_events(&mut self, events: Vec<LowerEvent>) {
        for event in events {
            match event {
                LowerEvent::Started { pbi } => self.on_voice_started(pbi),
                LowerEvent::PlayFailed { pbi } => self.terminating.push((pbi, TermCause::PlayFailed)),
                LowerEvent::SourceFailed { pbi } => {
                    self.terminating.push((pbi, TermCause::SourceFailed))
                }
                LowerEvent::EndReached { pbi } => self.terminating.push((pbi, TermCause::EndReached)),
                LowerEvent::Stopped { pbi } => self.terminating.push((pbi, TermCause::Stopped)),
            }
        }
    }

    fn on_voice_started(&mut self, id: PbiId) {
        let Some((node, game_object)) = self.voices.get(id).map(|p| (p.node, p.game_object)) else {
            return;
        };
        let (chains, change) = self.hierarchy.voice_started(node, game_object);
        if let Some(p) = self.voices.get_mut(id) {
            p.activity = Some(chains);
        }
        let ducking = self.ducking;
        for bus in change.became_active {
            self.pending.clear_internal(bus, ActionType::DuckRecovery);
            let mut ctx = self.duck_ctx();
            ducking.on_bus_active(bus, &mut ctx);
        }
        self.plan_next(id);
    }

    /// Pick the element after a chained voice and decide when it starts
    fn plan_next(&mut self, id: PbiId) {
        let Some(p) = self.voices.get(id) else {
            return;
        };
        let Some(chain) = p.chain.as_ref() else {
            return;
        };
        if chain.next.is_some() || chain.scheduled {
            return;
        }
        let game_object = p.game_object;
        let (history, list) = (chain.history.clone(), chain.list.clone());
        let (transition, transition_ms) = (chain.transition, chain.transition_ms);
        let loop_count = p.loop_count;
        let length_ms = p.media.as_ref().map_or(0.0, |m| {
            self.time.samples_to_ms(m.frames() * loop_count.max(1) as u64) as f32
        });

        let decision = {
            let mut selector = ContainerSelector::new(
                &self.hierarchy,
                &mut self.container_states,
                &self.syncs,
                game_object,
            );
            next_decision(&history, &list, &mut selector)
        };
        let NextDecision::Next {
            node,
            also,
            history,
            list,
        } = decision
        else {
            return;
        };
        let element = NextElement {
            node,
            also,
            history,
            list,
        };

        let timing = if loop_count == 0 {
            NextTiming::OnTermination {
                delay_ms: termination_delay(transition, transition_ms),
            }
        } else {
            crossfade_plan(transition, transition_ms, length_ms, self.config.min_crossfade_ms)
        };

        match timing {
            NextTiming::OnTermination { .. } => {
                if let Some(chain) = self.voices.get_mut(id).and_then(|p| p.chain.as_mut()) {
                    chain.next = Some(element);
                }
            }
            NextTiming::Scheduled {
                delay_ms,
                fade_ms,
                curve,
            } => {
                let fade = TransitionSpec::new(fade_ms, curve);
                let previous = (!fade.is_instant()).then_some(id);
                if self.schedule_continuation(id, element.clone(), delay_ms, fade, previous) {
                    if let Some(chain) = self.voices.get_mut(id).and_then(|p| p.chain.as_mut()) {
                        chain.next = Some(element);
                        chain.scheduled = true;
                    }
                }
            }
        }
    }

    /// Queue the continuation of voice `from`; returns whether it was queued
    fn schedule_continuation(
        &mut self,
        from: PbiId,
        element: NextElement,
        delay_ms: f32,
        fade: TransitionSpec,
        previous: Option<PbiId>,
    ) -> bool {
        let Some(origin) = self.voices.get(from).map(VoiceContext::of) else {
            return false;
        };
        self.schedule_continuation_of(origin, element, delay_ms, fade, previous)
    }

    fn schedule_continuation_of(
        &mut self,
        origin: VoiceContext,
        element: NextElement,
        delay_ms: f32,
        fade: TransitionSpec,
        previous: Option<PbiId>,
    ) -> bool {
        let (transition, transition_ms) = chain_transition(&self.hierarchy, &element.list);
        let action = Action::new(ActionType::PlayAndContinue, element.node);
        let launch = self
            .time
            .delay_from(self.now, self.time.ms_to_samples(delay_ms as f64));
        let handoff = ChainHandoff {
            element,
            pause_count: origin.pause_count,
            instigator: origin.instigator,
            transition,
            transition_ms,
            fade,
            previous,
        };
        let pa = PendingAction::new(
            Arc::new(action),
            origin.game_object,
            origin.playing_id,
            launch,
            PendingExtra {
                chain: Some(Box::new(handoff)),
            },
        )
        .with_custom_param(origin.custom_param);

        match self.pending.insert(pa) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("AudioEngine: continuation of pid {} dropped ({})", origin.playing_id, e);
                false
            }
        }
    }

    fn process_transitions(&mut self) {
        let updates = self.transitions.process(self.time.frames_per_tick as u64);
        self.apply_transition_updates(updates);
    }

    /// Hand transition values to their users
    fn apply_transition_updates(&mut self, updates: Vec<TransitionUpdate>) {
        let mut stop_reached = Vec::new();
        for update in updates {
            match update.user {
                TransitionUser::Voice { pbi, kind } => {
                    let (voices, mut ctx) = self.voices_and_ctx();
                    if let Some(p) = voices.get_mut(pbi) {
                        if p.on_fade(kind, update.value, update.terminated, &mut ctx) == FadeEvent::StopReached {
                            stop_reached.push(pbi);
                        }
                    }
                }
                TransitionUser::Duck {
                    source,
                    target,
                    scope,
                } => apply_duck(
                    &mut self.hierarchy,
                    source,
                    target,
                    scope,
                    update.value,
                    update.terminated,
                ),
                TransitionUser::Sis {
                    node,
                    game_object,
                    prop,
                } => self.apply_sis(node, game_object, prop, update.value, update.terminated),
                TransitionUser::State { node, prop } => {
                    self.hierarchy.set_state_value(node, prop, update.value)
                }
            }
        }
        self.terminating
            .extend(stop_reached.into_iter().map(|id| (id, TermCause::Stopped)));
    }

    /// Resolve voice and bus gains for the coming render
    fn update_mix(&mut self) -> HashMap<NodeId, f32> {
        let floor = self.config.max_duck_attenuation_db;
        for p in self.voices.iter() {
            if self.lower.cbx(p.id).is_none() {
                continue;
            }
            let ctx = ResolveCtx {
                syncs: &self.syncs,
                game_object: p.game_object,
                duck_floor_db: floor,
            };
            let params = voice_params(&self.hierarchy, &mut self.route_cache, p.node, &ctx);
            let gain = db_to_gain(params.volume_db) * p.fade_gain();
            self.lower
                .set_voice_mix(p.id, gain, params.mix_bus, p.flags.is_virtual);
        }

        let ctx = ResolveCtx {
            syncs: &self.syncs,
            game_object: INVALID_GAME_OBJECT,
            duck_floor_db: floor,
        };
        let mut gains = HashMap::new();
        for bus in self.lower.graph().levels().iter().flatten() {
            let params = bus_params(&self.hierarchy, &mut self.route_cache, *bus, &ctx);
            gains.insert(*bus, db_to_gain(params.volume_db));
        }
        gains
    }

    // ───────────────────────────────────────────────────────────────────────
    // Termination
    // ───────────────────────────────────────────────────────────────────────

    fn run_terminations(&mut self) {
        while !self.terminating.is_empty() {
            let batch = std::mem::take(&mut self.terminating);
            for (id, cause) in batch {
                self.terminate(id, cause);
            }
        }
    }

    /// Tear a voice down. A voice already gone is ignored, so a voice queued
    /// twice terminates once.
    fn terminate(&mut self, id: PbiId, cause: TermCause) {
        let Some(mut p) = self.voices.remove(id) else {
            return;
        };
        self.lower.remove_voice(id);
        {
            let mut ctx = PbiCtx {
                transitions: &mut self.transitions,
                commands: &mut self.commands,
                sink: self.sink.as_ref(),
                time: self.time,
                min_stop_fade_ms: self.config.min_stop_fade_ms,
            };
            p.release_transitions(&mut ctx);
        }
        self.commands.retain(|c| c.pbi != id);
        self.limiters.unregister(id, &p.limiters);

        if let Some(chains) = p.activity.take() {
            let change = self.hierarchy.voice_stopped(&chains, p.game_object);
            for bus in change.became_idle {
                self.on_bus_idle(bus);
            }
        }
        p.release_media();

        let handed_off = self.handed_off.remove(&id);
        let explicitly_stopped = p.flags.was_pre_stopped || p.flags.was_kicked;
        let reason = match cause {
            TermCause::Stopped | TermCause::EndReached if handed_off => {
                NotificationReason::StoppedAndContinue
            }
            TermCause::EndReached if explicitly_stopped => NotificationReason::Stopped,
            TermCause::EndReached => {
                if self.continue_chain(&p) {
                    NotificationReason::EndReachedAndContinue
                } else {
                    NotificationReason::EndReached
                }
            }
            TermCause::Stopped if p.connected => NotificationReason::Stopped,
            TermCause::Stopped | TermCause::PlayFailed => NotificationReason::PlayFailed,
            TermCause::SourceFailed if p.connected => NotificationReason::ContinueAborted,
            TermCause::SourceFailed => NotificationReason::PlayFailed,
            TermCause::Kicked(KickReason::ExplicitStop) => NotificationReason::Stopped,
            TermCause::Kicked(_) if !p.connected => NotificationReason::PlayFailedLimit,
            TermCause::Kicked(KickReason::NodeLimit) => NotificationReason::KickedByNodeLimit,
            TermCause::Kicked(KickReason::GlobalLimit) => NotificationReason::KickedByGlobalLimit,
        };
        log::debug!("{}: terminated ({})", id, reason.display_name());
        p.post(self.sink.as_ref(), reason);
        if self.hierarchy.release(p.node) {
            log::debug!("AudioEngine: {} destroyed after its last voice", p.node);
        }
    }

    /// Hand a finished chained voice over to its next element.
    ///
    /// Returns `true` when the chain goes on.
    fn continue_chain(&mut self, p: &Pbi) -> bool {
        let Some(chain) = p.chain.as_ref() else {
            return false;
        };
        if chain.scheduled {
            return true;
        }
        let Some(next) = chain.next.clone() else {
            return false;
        };
        let delay_ms = termination_delay(chain.transition, chain.transition_ms);
        self.schedule_continuation_of(VoiceContext::of(p), next, delay_ms, TransitionSpec::NONE, None)
    }

    fn on_bus_idle(&mut self, bus: NodeId) {
        let ducking = self.ducking;
        let outcome = {
            let mut ctx = self.duck_ctx();
            ducking.on_bus_idle(bus, &mut ctx)
        };
        let DuckOutcome::Pending { recovery_ms } = outcome else {
            return;
        };
        let launch = self
            .time
            .delay_from(self.now, self.time.ms_to_samples(recovery_ms as f64));
        let pa = PendingAction::new(
            Arc::new(Action::duck_recovery(bus)),
            INVALID_GAME_OBJECT,
            INVALID_PLAYING_ID,
            launch,
            PendingExtra::default(),
        );
        if let Err(e) = self.pending.insert(pa) {
            log::warn!("AudioEngine: duck recovery of {} not scheduled ({}), recovering now", bus, e);
            let mut ctx = self.duck_ctx();
            ducking.on_recovery(bus, &mut ctx);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a voice carried into its continuation
struct VoiceContext {
    game_object: GameObjectId,
    playing_id: PlayingId,
    custom_param: u64,
    pause_count: u32,
    instigator: Option<NodeId>,
}

impl VoiceContext {
    fn of(p: &Pbi) -> Self {
        Self {
            game_object: p.game_object,
            playing_id: p.playing_id,
            custom_param: p.custom_param,
            pause_count: p.pause_count(),
            instigator: p.instigator(),
        }
    }
}

/// Whether an action aimed at `target` reaches voice `p`
fn targets_voice(h: &Hierarchy, p: &Pbi, target: NodeId) -> bool {
    p.node == target
        || p.instigator() == Some(target)
        || h.node_chain(p.node).contains(&target)
        || h.effective_output_bus(p.node)
            .is_some_and(|bus| h.bus_chain(bus).contains(&target))
}

/// Transition settings of the innermost container a list is walking
fn chain_transition(h: &Hierarchy, list: &ContinuationList) -> (ContinuousTransition, f32) {
    list.innermost_container()
        .and_then(|c| h.node(c))
        .and_then(|n| n.container_data())
        .map_or((ContinuousTransition::Disabled, 0.0), |d| {
            (d.transition, d.transition_ms)
        })
}

fn chain_for(h: &Hierarchy, history: PlayHistory, list: ContinuationList) -> ChainState {
    let (transition, ms) = chain_transition(h, &list);
    ChainState::new(history, list).with_transition(transition, ms)
}

/// Gap before the next element when it starts on termination
fn termination_delay(transition: ContinuousTransition, transition_ms: f32) -> f32 {
    match transition {
        ContinuousTransition::Delay => transition_ms.max(0.0),
        _ => 0.0,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusData;
    use crate::lower::MediaData;
    use crate::node::{Node, SoundData};
    use crossbeam_channel::Receiver;
    use vox_core::FadeCurve;
    use vox_event::{ChannelSink, Notification};

    const MASTER: NodeId = NodeId(1);
    const SOUND: NodeId = NodeId(10);

    fn config() -> EngineConfig {
        EngineConfig {
            sample_rate: 48_000,
            frames_per_tick: 480,
            output_channels: 1,
            parallel_voices: false,
            ..Default::default()
        }
    }

    fn engine() -> (AudioEngine, Receiver<Notification>) {
        let (sink, rx) = ChannelSink::unbounded();
        let mut engine = AudioEngine::new(config(), Arc::new(sink)).unwrap();
        engine.init().unwrap();
        let h = engine.hierarchy_mut();
        h.add_node(Node::bus(MASTER, BusData::new())).unwrap();
        h.add_node(Node::sound(SOUND, SoundData::new(MediaData::constant(0.5, 48_000, 1))))
            .unwrap();
        h.set_output_bus(SOUND, Some(MASTER)).unwrap();
        (engine, rx)
    }

    fn reasons(rx: &Receiver<Notification>) -> Vec<NotificationReason> {
        rx.try_iter().map(|n| n.reason).collect()
    }

    #[test]
    fn test_init_twice_is_rejected() {
        let (mut engine, _rx) = engine();
        assert!(matches!(engine.init(), Err(VoxError::AlreadyInitialized)));
        engine.term().unwrap();
        assert!(matches!(engine.tick(), Err(VoxError::NotInitialized)));
    }

    #[test]
    fn test_play_renders_audio() {
        let (mut engine, rx) = engine();
        let pid = engine.play(SOUND, 5);
        engine.tick().unwrap();

        assert_eq!(engine.voices_of(pid).len(), 1);
        assert!(engine.output().iter().any(|s| *s > 0.0), "voice should be audible");
        assert!(reasons(&rx).contains(&NotificationReason::Play));
    }

    #[test]
    fn test_play_of_unknown_node_fails() {
        let (mut engine, rx) = engine();
        engine.play(NodeId(999), 5);
        engine.tick().unwrap();
        assert!(engine.voices().is_empty());
        assert!(reasons(&rx).contains(&NotificationReason::PlayFailed));
    }

    #[test]
    fn test_delayed_play_waits() {
        let (mut engine, rx) = engine();
        engine.post(ActionRecord::new(Action::play(SOUND).with_delay_ms(50.0), 5, 77));
        assert_eq!(engine.pending().len(), 1);

        for _ in 0..5 {
            engine.tick().unwrap();
            assert!(engine.voices().is_empty());
        }
        engine.tick().unwrap();
        assert_eq!(engine.voices_of(77).len(), 1);

        let seen = reasons(&rx);
        assert_eq!(seen[0], NotificationReason::DelayStarted);
        assert!(seen.contains(&NotificationReason::DelayEnded));
    }

    #[test]
    fn test_stop_with_fade_then_terminates() {
        let (mut engine, rx) = engine();
        let pid = engine.play(SOUND, 5);
        engine.tick().unwrap();

        engine.post(ActionRecord::new(
            Action::stop(SOUND).with_fade(20.0, FadeCurve::Linear),
            5,
            pid,
        ));
        engine.tick().unwrap();
        assert_eq!(engine.voices_of(pid).len(), 1, "still fading");
        engine.tick().unwrap();
        engine.tick().unwrap();
        assert!(engine.voices_of(pid).is_empty());

        let stopped = reasons(&rx)
            .into_iter()
            .filter(|r| *r == NotificationReason::Stopped)
            .count();
        assert_eq!(stopped, 1);
    }

    #[test]
    fn test_mute_silences_and_unmute_restores() {
        let (mut engine, rx) = engine();
        engine.play(SOUND, 5);
        engine.tick().unwrap();

        engine.post(ActionRecord::new(Action::mute(SOUND).global(), 0, 0));
        engine.tick().unwrap();
        assert!(engine.output().iter().all(|s| *s == 0.0), "muted");

        engine.post(ActionRecord::new(Action::unmute(SOUND).global(), 0, 0));
        engine.tick().unwrap();
        assert!(engine.output().iter().any(|s| *s > 0.0), "unmuted");

        let seen = reasons(&rx);
        assert!(seen.contains(&NotificationReason::Muted));
        assert!(seen.contains(&NotificationReason::Unmuted));
    }

    #[test]
    fn test_term_stops_everything() {
        let (mut engine, _rx) = engine();
        engine.post(ActionRecord::new(
            Action::play(SOUND).with_fade(1000.0, FadeCurve::Linear),
            5,
            2,
        ));
        engine.post(ActionRecord::new(Action::play(SOUND).with_delay_ms(500.0), 5, 3));
        engine.tick().unwrap();
        let held = engine.hierarchy().node(SOUND).map(|n| n.ref_count);
        assert_eq!(held, Some(2), "the voice holds its node");
        assert_eq!(engine.transitions().len(), 1);

        engine.term().unwrap();
        assert!(engine.voices().is_empty());
        assert!(engine.pending().is_empty());
        assert!(engine.transitions().is_empty());
        assert_eq!(engine.hierarchy().node(SOUND).map(|n| n.ref_count), Some(1));
        assert!(!engine.is_initialized());
    }
}
