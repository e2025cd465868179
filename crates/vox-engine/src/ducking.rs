//! Ducking engine
//!
//! A bus with duck targets attenuates those buses while it has voices.
//!
//! ```text
//!   OFF ──first voice──▶ ON ──last voice──▶ PENDING ──recovery──▶ OFF
//!                         │   (recovery > 0 and targets)   │
//!                         └──────last voice, otherwise─────┼──▶ OFF
//!                         ◀──────────voice starts──────────┘
//! ```
//!
//! Entering ON fades every target to its duck level. Entering PENDING
//! freezes the offsets where they are until the self-posted recovery action
//! fires. Entering OFF fades the targets back to 0 dB and, once there,
//! drops this source from their accumulators.

use vox_core::{NodeId, TimeBase};
use vox_event::{NotificationReason, NotificationSink};

use crate::bus::{DuckScope, DuckState, DuckTarget};
use crate::hierarchy::Hierarchy;
use crate::transition::{AddOutcome, TransitionManager, TransitionParams, TransitionUser};

/// What a ducking event did to the source bus
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DuckOutcome {
    /// Not a ducking bus, or already in the right state
    Unchanged,
    On,
    /// Waiting; post a recovery action after `recovery_ms`
    Pending { recovery_ms: f32 },
    Off,
}

/// Collaborators of a ducking event
pub struct DuckCtx<'a> {
    pub hierarchy: &'a mut Hierarchy,
    pub transitions: &'a mut TransitionManager,
    pub sink: &'a dyn NotificationSink,
    pub time: TimeBase,
}

/// Write a duck value into the target's accumulator
pub fn apply_duck(
    hierarchy: &mut Hierarchy,
    source: NodeId,
    target: NodeId,
    scope: DuckScope,
    value: f32,
    terminated: bool,
) {
    let Some(data) = hierarchy.node_mut(target).and_then(|n| n.bus_data_mut()) else {
        return;
    };
    if terminated && value == 0.0 {
        data.remove_duck_source(scope, source);
    } else {
        data.set_duck_offset(scope, source, value);
    }
}

fn duck_user(source: NodeId, target: &DuckTarget) -> TransitionUser {
    TransitionUser::Duck {
        source,
        target: target.target,
        scope: target.scope,
    }
}

/// Ramp one target toward `value`
fn fade_target(source: NodeId, target: &DuckTarget, value: f32, fade_ms: f32, ctx: &mut DuckCtx<'_>) {
    let user = duck_user(source, target);
    let duration = ctx.time.ms_to_samples(fade_ms as f64);

    if let Some(id) = ctx.transitions.find_user(user) {
        if duration > 0
            && ctx
                .transitions
                .change_parameter(id, value, duration, target.curve)
                .is_ok()
        {
            return;
        }
        ctx.transitions.remove_user(id, user);
        apply_duck(ctx.hierarchy, source, target.target, target.scope, value, true);
        return;
    }

    let current = ctx
        .hierarchy
        .node(target.target)
        .and_then(|n| n.bus_data())
        .map_or(0.0, |d| d.duck_offset_from(target.scope, source));
    match ctx
        .transitions
        .add(TransitionParams::new(current, value, duration, target.curve), user)
    {
        Ok(AddOutcome::Immediate(v)) => {
            apply_duck(ctx.hierarchy, source, target.target, target.scope, v, true)
        }
        Ok(AddOutcome::Started(_)) => {}
        Err(e) => {
            log::warn!("Duck fade {} -> {} not started ({})", source, target.target, e);
            apply_duck(ctx.hierarchy, source, target.target, target.scope, value, true);
        }
    }
}

/// Ducking state machine driver
#[derive(Debug, Clone, Copy, Default)]
pub struct DuckingEngine;

impl DuckingEngine {
    pub fn new() -> Self {
        Self
    }

    fn targets(hierarchy: &Hierarchy, bus: NodeId) -> Option<(DuckState, Vec<DuckTarget>, f32)> {
        let data = hierarchy.node(bus)?.bus_data()?;
        Some((data.duck_state, data.duck_targets.clone(), data.recovery_ms))
    }

    fn set_state(hierarchy: &mut Hierarchy, bus: NodeId, state: DuckState) {
        if let Some(data) = hierarchy.node_mut(bus).and_then(|n| n.bus_data_mut()) {
            data.duck_state = state;
        }
    }

    fn post(ctx: &DuckCtx<'_>, reason: NotificationReason, target: &DuckTarget, value: f32) {
        ctx.sink.post_notification(reason, 0, 0, 0, target.target, value);
    }

    /// First voice started on `bus`
    pub fn on_bus_active(&self, bus: NodeId, ctx: &mut DuckCtx<'_>) -> DuckOutcome {
        let Some((state, targets, _)) = Self::targets(ctx.hierarchy, bus) else {
            return DuckOutcome::Unchanged;
        };
        if state == DuckState::On {
            return DuckOutcome::Unchanged;
        }
        Self::set_state(ctx.hierarchy, bus, DuckState::On);
        if targets.is_empty() {
            return DuckOutcome::Unchanged;
        }
        for target in &targets {
            fade_target(bus, target, target.duck_db, target.fade_in_ms, ctx);
            Self::post(ctx, NotificationReason::Ducked, target, target.duck_db);
        }
        log::debug!("Bus {} ducking {} target(s)", bus, targets.len());
        DuckOutcome::On
    }

    /// Last voice stopped on `bus`
    pub fn on_bus_idle(&self, bus: NodeId, ctx: &mut DuckCtx<'_>) -> DuckOutcome {
        let Some((state, targets, recovery_ms)) = Self::targets(ctx.hierarchy, bus) else {
            return DuckOutcome::Unchanged;
        };
        if state != DuckState::On {
            return DuckOutcome::Unchanged;
        }
        if targets.is_empty() {
            Self::set_state(ctx.hierarchy, bus, DuckState::Off);
            return DuckOutcome::Unchanged;
        }
        if recovery_ms > 0.0 {
            Self::set_state(ctx.hierarchy, bus, DuckState::Pending);
            for target in &targets {
                self.freeze(bus, target, ctx);
            }
            return DuckOutcome::Pending { recovery_ms };
        }
        self.unduck(bus, &targets, ctx);
        DuckOutcome::Off
    }

    /// Recovery delay elapsed without a new voice
    pub fn on_recovery(&self, bus: NodeId, ctx: &mut DuckCtx<'_>) -> DuckOutcome {
        let Some((state, targets, _)) = Self::targets(ctx.hierarchy, bus) else {
            return DuckOutcome::Unchanged;
        };
        if state != DuckState::Pending {
            return DuckOutcome::Unchanged;
        }
        self.unduck(bus, &targets, ctx);
        DuckOutcome::Off
    }

    /// Hold a target at its current offset
    fn freeze(&self, source: NodeId, target: &DuckTarget, ctx: &mut DuckCtx<'_>) {
        let user = duck_user(source, target);
        if let Some(id) = ctx.transitions.find_user(user) {
            let value = ctx.transitions.value(id).unwrap_or(target.duck_db);
            ctx.transitions.remove_user(id, user);
            apply_duck(ctx.hierarchy, source, target.target, target.scope, value, false);
        }
    }

    fn unduck(&self, bus: NodeId, targets: &[DuckTarget], ctx: &mut DuckCtx<'_>) {
        Self::set_state(ctx.hierarchy, bus, DuckState::Off);
        for target in targets {
            fade_target(bus, target, 0.0, target.fade_out_ms, ctx);
            Self::post(ctx, NotificationReason::Unducked, target, 0.0);
        }
        log::debug!("Bus {} released its duck targets", bus);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
