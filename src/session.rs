use std::sync::Arc;

use anyhow::Result;

use crate::engine::{
    bindings_for, ImageReference, ObserverToken, RenderEngine, SurfaceId, ViewportKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unmounted,
    Mounting,
    Ready,
    Reconfiguring,
}

/// Owns one rendering surface: creation, tool binding, resize observation,
/// stack assignment, teardown. Operations invoked before the surface is ready
/// are dropped silently; nothing ever reaches a torn-down surface.
pub struct ViewportSession {
    engine: Arc<dyn RenderEngine>,
    state: SessionState,
    kind: ViewportKind,
    surface: Option<SurfaceId>,
    observer: Option<ObserverToken>,
    last_stack: Option<Vec<ImageReference>>,
}

impl ViewportSession {
    pub fn new(engine: Arc<dyn RenderEngine>, kind: ViewportKind) -> Self {
        Self {
            engine,
            state: SessionState::Unmounted,
            kind,
            surface: None,
            observer: None,
            last_stack: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kind(&self) -> ViewportKind {
        self.kind
    }

    pub fn surface(&self) -> Option<SurfaceId> {
        self.surface
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn last_stack(&self) -> Option<&[ImageReference]> {
        self.last_stack.as_deref()
    }

    /// Idempotent: mounting an already-ready session with the same kind is a
    /// no-op; with a different kind it reconfigures in place.
    pub fn mount(&mut self, kind: ViewportKind) -> Result<()> {
        if self.surface.is_some() {
            if self.kind == kind {
                return Ok(());
            }
            return self.switch_kind(kind);
        }

        self.state = SessionState::Mounting;
        self.kind = kind;
        let surface = self.engine.create_surface(kind)?;
        self.engine.bind_tools(surface, &bindings_for(kind));
        let resize_engine = Arc::clone(&self.engine);
        let token = self
            .engine
            .observe_size(surface, Box::new(move || resize_engine.resize(surface)));
        self.surface = Some(surface);
        self.observer = Some(token);
        self.state = SessionState::Ready;

        if let Some(stack) = self.last_stack.clone() {
            self.engine.apply_image_list(surface, &stack)?;
        }
        Ok(())
    }

    /// Tears down and recreates the surface under the new kind, re-applying
    /// the previously loaded stack so content survives the switch.
    pub fn switch_kind(&mut self, kind: ViewportKind) -> Result<()> {
        let Some(old_surface) = self.surface.take() else {
            log::debug!("switch_kind({kind:?}) before mount; ignored");
            return Ok(());
        };

        self.state = SessionState::Reconfiguring;
        if let Some(token) = self.observer.take() {
            self.engine.unobserve(token);
        }
        self.engine.destroy_surface(old_surface);

        self.kind = kind;
        let surface = self.engine.create_surface(kind)?;
        self.engine.bind_tools(surface, &bindings_for(kind));
        let resize_engine = Arc::clone(&self.engine);
        let token = self
            .engine
            .observe_size(surface, Box::new(move || resize_engine.resize(surface)));
        self.surface = Some(surface);
        self.observer = Some(token);
        self.state = SessionState::Ready;

        if let Some(stack) = self.last_stack.clone() {
            self.engine.apply_image_list(surface, &stack)?;
        }
        Ok(())
    }

    /// Atomically replaces the slot's stack. An empty list is a no-op: it
    /// never clears existing content. Dropped silently unless Ready.
    pub fn apply_stack(&mut self, references: &[ImageReference]) -> Result<()> {
        if references.is_empty() {
            return Ok(());
        }
        let (SessionState::Ready, Some(surface)) = (self.state, self.surface) else {
            log::debug!(
                "apply_stack of {} reference(s) while {:?}; dropped",
                references.len(),
                self.state
            );
            return Ok(());
        };
        self.last_stack = Some(references.to_vec());
        self.engine.apply_image_list(surface, references)
    }

    /// Releases the surface and its size observer. Safe to call repeatedly.
    pub fn unmount(&mut self) {
        if let Some(token) = self.observer.take() {
            self.engine.unobserve(token);
        }
        if let Some(surface) = self.surface.take() {
            self.engine.destroy_surface(surface);
        }
        self.state = SessionState::Unmounted;
    }
}

impl Drop for ViewportSession {
    fn drop(&mut self) {
        self.unmount();
    }
}
