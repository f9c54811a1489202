use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

/// Opaque key addressing one decodable image. Produced by [`FileRegistry::register`];
/// order within a series is slice order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference(String);

impl ImageReference {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportKind {
    Stack,
    Volume,
    Volume3d,
}

impl ViewportKind {
    pub fn label(self) -> &'static str {
        match self {
            ViewportKind::Stack => "2D",
            ViewportKind::Volume => "MPR",
            ViewportKind::Volume3d => "3D",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    Primary,
    Secondary,
    Auxiliary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    WindowLevel,
    Zoom,
    Pan,
    SliceScroll,
    Rotate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolBinding {
    Pointer(PointerButton, ToolKind),
    Wheel(ToolKind),
}

/// Standard tool set per viewport kind. The primary button does window/level
/// except in 3-D, where it rotates; the wheel scrolls slices except in 3-D,
/// where it is unbound.
pub fn bindings_for(kind: ViewportKind) -> Vec<ToolBinding> {
    let primary = match kind {
        ViewportKind::Volume3d => ToolKind::Rotate,
        _ => ToolKind::WindowLevel,
    };
    let mut bindings = vec![
        ToolBinding::Pointer(PointerButton::Primary, primary),
        ToolBinding::Pointer(PointerButton::Secondary, ToolKind::Zoom),
        ToolBinding::Pointer(PointerButton::Auxiliary, ToolKind::Pan),
    ];
    if kind != ViewportKind::Volume3d {
        bindings.push(ToolBinding::Wheel(ToolKind::SliceScroll));
    }
    bindings
}

pub type SurfaceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverToken(pub(crate) u64);

/// One decoded, display-ready frame.
#[derive(Debug, Clone)]
pub struct FramePixels {
    pub width: usize,
    pub height: usize,
    pub rgba: Vec<u8>,
}

/// Capability surface of the rendering engine. The session layer only ever
/// talks to this trait; the shipped implementation lives in `render.rs`.
pub trait RenderEngine: Send + Sync {
    fn create_surface(&self, kind: ViewportKind) -> Result<SurfaceId>;
    fn destroy_surface(&self, surface: SurfaceId);
    fn bind_tools(&self, surface: SurfaceId, bindings: &[ToolBinding]);
    /// Replaces the surface's stack wholesale and triggers a render pass.
    fn apply_image_list(&self, surface: SurfaceId, references: &[ImageReference]) -> Result<()>;
    fn resize(&self, surface: SurfaceId);
    fn load_frame(&self, reference: &ImageReference) -> Result<FramePixels>;
    fn observe_size(
        &self,
        surface: SurfaceId,
        on_change: Box<dyn Fn() + Send + Sync>,
    ) -> ObserverToken;
    fn unobserve(&self, token: ObserverToken);
}

struct RegisteredFile {
    name: String,
    bytes: Arc<[u8]>,
}

/// Process-wide mapping from registered payloads to addressable references.
/// Append-only for the process lifetime; entries are never evicted.
pub struct FileRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ImageReference, RegisteredFile>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, bytes: Vec<u8>) -> ImageReference {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reference = ImageReference(format!("dicomfile:{id}"));
        let mut entries = self.entries.lock().expect("file registry lock poisoned");
        entries.insert(
            reference.clone(),
            RegisteredFile {
                name: name.to_string(),
                bytes: Arc::from(bytes.into_boxed_slice()),
            },
        );
        reference
    }

    pub fn bytes(&self, reference: &ImageReference) -> Option<Arc<[u8]>> {
        let entries = self.entries.lock().expect("file registry lock poisoned");
        entries.get(reference).map(|entry| Arc::clone(&entry.bytes))
    }

    pub fn file_name(&self, reference: &ImageReference) -> Option<String> {
        let entries = self.entries.lock().expect("file registry lock poisoned");
        entries.get(reference).map(|entry| entry.name.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("file registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EngineEvent {
        Created(SurfaceId, ViewportKind),
        Destroyed(SurfaceId),
        BoundTools(SurfaceId, Vec<ToolBinding>),
        Applied(SurfaceId, Vec<ImageReference>),
        Resized(SurfaceId),
        Observed(SurfaceId),
        Unobserved(u64),
    }

    #[derive(Default)]
    struct RecordingState {
        next_surface: u64,
        next_observer: u64,
        alive: Vec<SurfaceId>,
        stacks: HashMap<SurfaceId, Vec<ImageReference>>,
        events: Vec<EngineEvent>,
    }

    /// Records every engine call so session/coordinator tests can assert on
    /// resource lifecycles without a real renderer.
    #[derive(Default)]
    pub struct RecordingEngine {
        state: Mutex<RecordingState>,
        pub fail_load: Mutex<Vec<ImageReference>>,
    }

    impl RecordingEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<EngineEvent> {
            self.state.lock().expect("recording lock").events.clone()
        }

        pub fn alive_surfaces(&self) -> Vec<SurfaceId> {
            self.state.lock().expect("recording lock").alive.clone()
        }

        pub fn stack_of(&self, surface: SurfaceId) -> Option<Vec<ImageReference>> {
            self.state
                .lock()
                .expect("recording lock")
                .stacks
                .get(&surface)
                .cloned()
        }
    }

    impl RenderEngine for RecordingEngine {
        fn create_surface(&self, kind: ViewportKind) -> Result<SurfaceId> {
            let mut state = self.state.lock().expect("recording lock");
            state.next_surface += 1;
            let surface = state.next_surface;
            state.alive.push(surface);
            state.events.push(EngineEvent::Created(surface, kind));
            Ok(surface)
        }

        fn destroy_surface(&self, surface: SurfaceId) {
            let mut state = self.state.lock().expect("recording lock");
            state.alive.retain(|alive| *alive != surface);
            state.stacks.remove(&surface);
            state.events.push(EngineEvent::Destroyed(surface));
        }

        fn bind_tools(&self, surface: SurfaceId, bindings: &[ToolBinding]) {
            let mut state = self.state.lock().expect("recording lock");
            state
                .events
                .push(EngineEvent::BoundTools(surface, bindings.to_vec()));
        }

        fn apply_image_list(
            &self,
            surface: SurfaceId,
            references: &[ImageReference],
        ) -> Result<()> {
            let mut state = self.state.lock().expect("recording lock");
            state.stacks.insert(surface, references.to_vec());
            state
                .events
                .push(EngineEvent::Applied(surface, references.to_vec()));
            Ok(())
        }

        fn resize(&self, surface: SurfaceId) {
            let mut state = self.state.lock().expect("recording lock");
            state.events.push(EngineEvent::Resized(surface));
        }

        fn load_frame(&self, reference: &ImageReference) -> Result<FramePixels> {
            if self
                .fail_load
                .lock()
                .expect("recording lock")
                .contains(reference)
            {
                anyhow::bail!("decode failed for {reference}");
            }
            Ok(FramePixels {
                width: 4,
                height: 4,
                rgba: vec![128; 4 * 4 * 4],
            })
        }

        fn observe_size(
            &self,
            surface: SurfaceId,
            _on_change: Box<dyn Fn() + Send + Sync>,
        ) -> ObserverToken {
            let mut state = self.state.lock().expect("recording lock");
            state.next_observer += 1;
            let token = state.next_observer;
            state.events.push(EngineEvent::Observed(surface));
            ObserverToken(token)
        }

        fn unobserve(&self, token: ObserverToken) {
            let mut state = self.state.lock().expect("recording lock");
            state.events.push(EngineEvent::Unobserved(token.0));
        }
    }
}
