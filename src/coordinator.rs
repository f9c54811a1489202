use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::engine::{ImageReference, RenderEngine, SurfaceId, ViewportKind};
use crate::session::ViewportSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Single,
    Quad,
}

impl Layout {
    pub fn slots(self) -> &'static [SlotId] {
        match self {
            Layout::Single => &[SlotId::First],
            Layout::Quad => &[SlotId::First, SlotId::Second, SlotId::Third, SlotId::Fourth],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotId {
    First,
    Second,
    Third,
    Fourth,
}

impl SlotId {
    pub fn label(self) -> &'static str {
        match self {
            SlotId::First => "first",
            SlotId::Second => "second",
            SlotId::Third => "third",
            SlotId::Fourth => "fourth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTarget {
    Active,
    Slot(SlotId),
    AllVisible,
}

/// Issued by [`MultiViewportCoordinator::begin_load`]. Captures the per-slot
/// load sequence at issue time; a commit whose sequence has been overtaken is
/// stale and is dropped, so later-issued loads win regardless of completion
/// order.
#[derive(Debug, Clone)]
pub struct LoadTicket {
    slots: Vec<(SlotId, u64)>,
}

/// Owns the viewport sessions for the current layout, routes load requests to
/// the right session, and reconciles layout transitions without disturbing
/// slots that survive them.
pub struct MultiViewportCoordinator {
    engine: Arc<dyn RenderEngine>,
    layout: Layout,
    kind: ViewportKind,
    sessions: BTreeMap<SlotId, ViewportSession>,
    active: SlotId,
    load_seq: BTreeMap<SlotId, u64>,
    pending: Option<Vec<ImageReference>>,
    pending_consumed: bool,
}

impl MultiViewportCoordinator {
    pub fn new(engine: Arc<dyn RenderEngine>, kind: ViewportKind) -> Self {
        Self {
            engine,
            layout: Layout::Single,
            kind,
            sessions: BTreeMap::new(),
            active: SlotId::First,
            load_seq: BTreeMap::new(),
            pending: None,
            pending_consumed: false,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn kind(&self) -> ViewportKind {
        self.kind
    }

    pub fn active_slot(&self) -> SlotId {
        self.active
    }

    pub fn set_active_slot(&mut self, slot: SlotId) {
        if self.sessions.contains_key(&slot) {
            self.active = slot;
        }
    }

    pub fn slot_surface(&self, slot: SlotId) -> Option<SurfaceId> {
        self.sessions.get(&slot).and_then(ViewportSession::surface)
    }

    pub fn slot_stack(&self, slot: SlotId) -> Option<&[ImageReference]> {
        self.sessions.get(&slot).and_then(ViewportSession::last_stack)
    }

    pub fn visible_slots(&self) -> &'static [SlotId] {
        self.layout.slots()
    }

    /// A previously resolved reference list carried over from navigation.
    /// Applied to the default target exactly once after the first successful
    /// mount; the one-shot guard keeps later remounts from re-applying it.
    pub fn set_pending_stack(&mut self, references: Vec<ImageReference>) {
        self.pending = Some(references);
        self.pending_consumed = false;
    }

    pub fn pending_consumed(&self) -> bool {
        self.pending_consumed
    }

    /// Creates sessions for newly required slots and releases the rest.
    /// Sessions present in both the old and the new layout are left alone, so
    /// their surfaces and content survive the transition.
    pub fn set_layout(&mut self, layout: Layout) -> Result<()> {
        self.layout = layout;
        let required = layout.slots();

        let stale: Vec<SlotId> = self
            .sessions
            .keys()
            .copied()
            .filter(|slot| !required.contains(slot))
            .collect();
        for slot in stale {
            if let Some(mut session) = self.sessions.remove(&slot) {
                session.unmount();
            }
            // a ticket issued against the removed incarnation must never
            // commit into a later one
            *self.load_seq.entry(slot).or_insert(0) += 1;
        }

        for slot in required {
            if !self.sessions.contains_key(slot) {
                let mut session = ViewportSession::new(Arc::clone(&self.engine), self.kind);
                session.mount(self.kind)?;
                self.sessions.insert(*slot, session);
            }
        }

        if !required.contains(&self.active) {
            self.active = SlotId::First;
        }

        self.apply_pending_once()?;
        Ok(())
    }

    /// Switches every live session to the new viewport kind; loaded stacks
    /// survive the switch (see `ViewportSession::switch_kind`).
    pub fn set_kind(&mut self, kind: ViewportKind) -> Result<()> {
        if self.kind == kind {
            return Ok(());
        }
        self.kind = kind;
        for session in self.sessions.values_mut() {
            session.switch_kind(kind)?;
        }
        Ok(())
    }

    fn target_slots(&self, target: LoadTarget) -> Vec<SlotId> {
        match target {
            LoadTarget::Active => vec![self.active],
            LoadTarget::Slot(slot) => vec![slot],
            LoadTarget::AllVisible => self.layout.slots().to_vec(),
        }
    }

    /// Starts a load for `target`, bumping each affected slot's sequence.
    pub fn begin_load(&mut self, target: LoadTarget) -> LoadTicket {
        let slots = self
            .target_slots(target)
            .into_iter()
            .map(|slot| {
                let seq = self.load_seq.entry(slot).or_insert(0);
                *seq += 1;
                (slot, *seq)
            })
            .collect();
        LoadTicket { slots }
    }

    /// Applies `references` to the ticket's slots, skipping any slot whose
    /// sequence has moved on since the ticket was issued.
    pub fn commit_load(&mut self, ticket: &LoadTicket, references: &[ImageReference]) -> Result<()> {
        for (slot, seq) in &ticket.slots {
            let current = self.load_seq.get(slot).copied().unwrap_or(0);
            if current != *seq {
                log::debug!(
                    "dropping stale load for slot {} (issued {seq}, current {current})",
                    slot.label()
                );
                continue;
            }
            if let Some(session) = self.sessions.get_mut(slot) {
                session.apply_stack(references)?;
            }
        }
        Ok(())
    }

    /// Synchronous load: issue and commit in one step.
    pub fn load_into(&mut self, references: &[ImageReference], target: LoadTarget) -> Result<()> {
        let ticket = self.begin_load(target);
        self.commit_load(&ticket, references)
    }

    fn apply_pending_once(&mut self) -> Result<()> {
        if self.pending_consumed {
            return Ok(());
        }
        let any_ready = self.sessions.values().any(ViewportSession::is_ready);
        if !any_ready {
            return Ok(());
        }
        let Some(references) = self.pending.take() else {
            return Ok(());
        };
        self.pending_consumed = true;
        log::info!(
            "applying carried-over stack of {} reference(s) to slot {}",
            references.len(),
            self.active.label()
        );
        self.load_into(&references, LoadTarget::Active)
    }

    /// Tears down every session. Safe to call repeatedly.
    pub fn unmount_all(&mut self) {
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            session.unmount();
        }
    }
}

impl Drop for MultiViewportCoordinator {
    fn drop(&mut self) {
        self.unmount_all();
    }
}
