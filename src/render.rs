use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use dicom_object::{from_reader, DefaultDicomObject};
use dicom_pixeldata::PixelDecoder;

use crate::engine::{
    FramePixels, ImageReference, ObserverToken, PointerButton, RenderEngine, SurfaceId,
    ToolBinding, ToolKind, ViewportKind,
};
use crate::engine::FileRegistry;

const MIN_ZOOM: f32 = 0.1;
const MAX_ZOOM: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorMode {
    Monochrome,
    Rgb,
}

/// One decoded instance. Stacks are one instance per slice, so only frame 0
/// of each object is decoded.
struct DecodedImage {
    width: usize,
    height: usize,
    color_mode: ColorMode,
    invert: bool,
    window_center: f32,
    window_width: f32,
    min_value: i32,
    max_value: i32,
    samples_per_pixel: u16,
    mono_pixels: Vec<i32>,
    rgb_pixels: Vec<u8>,
}

/// Per-surface view state. Window overrides start unset and fall back to the
/// image defaults until the user drags.
struct SurfaceState {
    kind: ViewportKind,
    stack: Vec<ImageReference>,
    slice_index: usize,
    bindings: Vec<ToolBinding>,
    window_center: Option<f32>,
    window_width: Option<f32>,
    zoom: f32,
    pan: (f32, f32),
    rotation_deg: f32,
}

impl SurfaceState {
    fn new(kind: ViewportKind) -> Self {
        Self {
            kind,
            stack: Vec::new(),
            slice_index: 0,
            bindings: Vec::new(),
            window_center: None,
            window_width: None,
            zoom: 1.0,
            pan: (0.0, 0.0),
            rotation_deg: 0.0,
        }
    }

    fn tool_for(&self, button: PointerButton) -> Option<ToolKind> {
        self.bindings.iter().find_map(|binding| match binding {
            ToolBinding::Pointer(bound, tool) if *bound == button => Some(*tool),
            _ => None,
        })
    }

    fn wheel_tool(&self) -> Option<ToolKind> {
        self.bindings.iter().find_map(|binding| match binding {
            ToolBinding::Wheel(tool) => Some(*tool),
            _ => None,
        })
    }
}

/// CPU implementation of [`RenderEngine`] over registered DICOM payloads.
/// Decoded instances are cached per reference and shared across surfaces.
pub struct SoftwareEngine {
    registry: Arc<FileRegistry>,
    surfaces: Mutex<HashMap<SurfaceId, SurfaceState>>,
    decoded: Mutex<HashMap<ImageReference, Arc<DecodedImage>>>,
    next_surface: AtomicU64,
    next_observer: AtomicU64,
    observers: Mutex<HashMap<u64, (SurfaceId, Box<dyn Fn() + Send + Sync>)>>,
}

impl SoftwareEngine {
    pub fn new(registry: Arc<FileRegistry>) -> Self {
        Self {
            registry,
            surfaces: Mutex::new(HashMap::new()),
            decoded: Mutex::new(HashMap::new()),
            next_surface: AtomicU64::new(1),
            next_observer: AtomicU64::new(1),
            observers: Mutex::new(HashMap::new()),
        }
    }

    /// Renders the surface's current slice with its window overrides.
    /// `None` when the surface has no stack yet.
    pub fn surface_frame(&self, surface: SurfaceId) -> Result<Option<FramePixels>> {
        let (reference, center, width) = {
            let surfaces = self.surfaces.lock().expect("surface table lock poisoned");
            let Some(state) = surfaces.get(&surface) else {
                return Ok(None);
            };
            let Some(reference) = state.stack.get(state.slice_index).cloned() else {
                return Ok(None);
            };
            (reference, state.window_center, state.window_width)
        };

        let image = self.decoded_image(&reference)?;
        let center = center.unwrap_or(image.window_center);
        let width = width.unwrap_or(image.window_width);
        Ok(Some(render_image(&image, center, width)))
    }

    pub fn slice_position(&self, surface: SurfaceId) -> Option<(usize, usize)> {
        let surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        let state = surfaces.get(&surface)?;
        if state.stack.is_empty() {
            return None;
        }
        Some((state.slice_index, state.stack.len()))
    }

    pub fn view_transform(&self, surface: SurfaceId) -> Option<(f32, (f32, f32), f32)> {
        let surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        surfaces
            .get(&surface)
            .map(|state| (state.zoom, state.pan, state.rotation_deg))
    }

    pub fn window_of(&self, surface: SurfaceId) -> Option<(f32, f32)> {
        let surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        let state = surfaces.get(&surface)?;
        let reference = state.stack.get(state.slice_index)?.clone();
        let (center, width) = (state.window_center, state.window_width);
        drop(surfaces);
        let image = self.decoded_image(&reference).ok()?;
        Some((
            center.unwrap_or(image.window_center),
            width.unwrap_or(image.window_width),
        ))
    }

    /// Routes a pointer drag to the tool bound for `button` on this surface.
    pub fn pointer_drag(&self, surface: SurfaceId, button: PointerButton, delta: (f32, f32)) {
        let tool = {
            let surfaces = self.surfaces.lock().expect("surface table lock poisoned");
            surfaces.get(&surface).and_then(|state| state.tool_for(button))
        };
        let Some(tool) = tool else {
            return;
        };
        match tool {
            ToolKind::WindowLevel => self.apply_window_level_drag(surface, delta),
            ToolKind::Zoom => self.apply_zoom_drag(surface, delta.1),
            ToolKind::Pan => self.apply_pan_drag(surface, delta),
            ToolKind::Rotate => self.apply_rotate_drag(surface, delta.0),
            ToolKind::SliceScroll => self.step_slice(surface, delta.1 as i64),
        }
    }

    /// Routes wheel movement; a surface with no wheel binding ignores it.
    pub fn wheel_scroll(&self, surface: SurfaceId, steps: i64) {
        let tool = {
            let surfaces = self.surfaces.lock().expect("surface table lock poisoned");
            surfaces.get(&surface).and_then(|state| state.wheel_tool())
        };
        match tool {
            Some(ToolKind::SliceScroll) => self.step_slice(surface, steps),
            Some(ToolKind::Zoom) => self.apply_zoom_drag(surface, steps as f32 * 10.0),
            _ => {}
        }
    }

    /// Fires the size observers registered for `surface`. The app shell calls
    /// this when the panel hosting the surface changes size.
    pub fn notify_resize(&self, surface: SurfaceId) {
        let observers = self.observers.lock().expect("observer table lock poisoned");
        for (observed, callback) in observers.values() {
            if *observed == surface {
                callback();
            }
        }
    }

    fn apply_window_level_drag(&self, surface: SurfaceId, delta: (f32, f32)) {
        let reference = {
            let surfaces = self.surfaces.lock().expect("surface table lock poisoned");
            let Some(state) = surfaces.get(&surface) else {
                return;
            };
            let Some(reference) = state.stack.get(state.slice_index).cloned() else {
                return;
            };
            reference
        };
        let (default_center, default_width, range) = match self.decoded_image(&reference) {
            Ok(image) => (
                image.window_center,
                image.window_width,
                (image.max_value - image.min_value).max(1) as f32,
            ),
            Err(_) => return,
        };

        let sensitivity = range / 512.0;
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        if let Some(state) = surfaces.get_mut(&surface) {
            let center = state.window_center.unwrap_or(default_center) + delta.1 * sensitivity;
            let width =
                (state.window_width.unwrap_or(default_width) + delta.0 * sensitivity).max(1.0);
            state.window_center = Some(center);
            state.window_width = Some(width);
        }
    }

    fn apply_zoom_drag(&self, surface: SurfaceId, delta_y: f32) {
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        if let Some(state) = surfaces.get_mut(&surface) {
            state.zoom = (state.zoom * (1.0 - delta_y * 0.005)).clamp(MIN_ZOOM, MAX_ZOOM);
        }
    }

    fn apply_pan_drag(&self, surface: SurfaceId, delta: (f32, f32)) {
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        if let Some(state) = surfaces.get_mut(&surface) {
            state.pan.0 += delta.0;
            state.pan.1 += delta.1;
        }
    }

    fn apply_rotate_drag(&self, surface: SurfaceId, delta_x: f32) {
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        if let Some(state) = surfaces.get_mut(&surface) {
            state.rotation_deg = (state.rotation_deg + delta_x * 0.5).rem_euclid(360.0);
        }
    }

    fn step_slice(&self, surface: SurfaceId, steps: i64) {
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        if let Some(state) = surfaces.get_mut(&surface) {
            if state.stack.is_empty() {
                return;
            }
            let last = state.stack.len() as i64 - 1;
            let next = (state.slice_index as i64 + steps).clamp(0, last);
            state.slice_index = next as usize;
        }
    }

    fn decoded_image(&self, reference: &ImageReference) -> Result<Arc<DecodedImage>> {
        {
            let decoded = self.decoded.lock().expect("decode cache lock poisoned");
            if let Some(image) = decoded.get(reference) {
                return Ok(Arc::clone(image));
            }
        }

        let bytes = self
            .registry
            .bytes(reference)
            .with_context(|| format!("{reference} is not registered"))?;
        let image = Arc::new(decode_instance(&bytes)?);

        let mut decoded = self.decoded.lock().expect("decode cache lock poisoned");
        Ok(Arc::clone(decoded.entry(reference.clone()).or_insert(image)))
    }
}

impl RenderEngine for SoftwareEngine {
    fn create_surface(&self, kind: ViewportKind) -> Result<SurfaceId> {
        let surface = self.next_surface.fetch_add(1, Ordering::Relaxed);
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        surfaces.insert(surface, SurfaceState::new(kind));
        log::debug!("created {kind:?} surface {surface}");
        Ok(surface)
    }

    fn destroy_surface(&self, surface: SurfaceId) {
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        surfaces.remove(&surface);
        drop(surfaces);
        let mut observers = self.observers.lock().expect("observer table lock poisoned");
        observers.retain(|_, (observed, _)| *observed != surface);
        log::debug!("destroyed surface {surface}");
    }

    fn bind_tools(&self, surface: SurfaceId, bindings: &[ToolBinding]) {
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        if let Some(state) = surfaces.get_mut(&surface) {
            state.bindings = bindings.to_vec();
        }
    }

    fn apply_image_list(&self, surface: SurfaceId, references: &[ImageReference]) -> Result<()> {
        for reference in references {
            if self.registry.bytes(reference).is_none() {
                bail!("{reference} is not registered");
            }
        }
        let mut surfaces = self.surfaces.lock().expect("surface table lock poisoned");
        let Some(state) = surfaces.get_mut(&surface) else {
            bail!("surface {surface} does not exist");
        };
        state.stack = references.to_vec();
        state.slice_index = 0;
        state.window_center = None;
        state.window_width = None;
        state.zoom = 1.0;
        state.pan = (0.0, 0.0);
        state.rotation_deg = 0.0;
        Ok(())
    }

    fn resize(&self, surface: SurfaceId) {
        // nothing cached at panel resolution; the next frame re-renders
        log::trace!("resize for surface {surface}");
    }

    fn load_frame(&self, reference: &ImageReference) -> Result<FramePixels> {
        let image = self.decoded_image(reference)?;
        Ok(render_image(&image, image.window_center, image.window_width))
    }

    fn observe_size(
        &self,
        surface: SurfaceId,
        on_change: Box<dyn Fn() + Send + Sync>,
    ) -> ObserverToken {
        let token = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let mut observers = self.observers.lock().expect("observer table lock poisoned");
        observers.insert(token, (surface, on_change));
        ObserverToken(token)
    }

    fn unobserve(&self, token: ObserverToken) {
        let mut observers = self.observers.lock().expect("observer table lock poisoned");
        observers.remove(&token.0);
    }
}

fn decode_instance(bytes: &[u8]) -> Result<DecodedImage> {
    let obj = from_reader(Cursor::new(strip_preamble(bytes)))
        .context("Could not parse DICOM payload")?;
    decode_object(&obj)
}

/// `from_reader` expects the stream to start at the DICM magic; file payloads
/// carry a 128-byte preamble first.
fn strip_preamble(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= 132 && &bytes[128..132] == b"DICM" {
        return &bytes[128..];
    }
    bytes
}

fn decode_object(obj: &DefaultDicomObject) -> Result<DecodedImage> {
    let width: usize = obj
        .element_by_name("Columns")
        .context("Missing Columns tag")?
        .to_int()
        .context("Invalid Columns value")?;
    let height: usize = obj
        .element_by_name("Rows")
        .context("Missing Rows tag")?
        .to_int()
        .context("Invalid Rows value")?;

    let photometric = read_string_or_default(obj, "PhotometricInterpretation", "MONOCHROME2");
    let invert = photometric.eq_ignore_ascii_case("MONOCHROME1");

    let decoded = obj
        .decode_pixel_data_frame(0)
        .context("Failed to decode PixelData frame 0")?;
    let samples_per_pixel = decoded.samples_per_pixel();
    let bits_allocated = decoded.bits_allocated();
    if bits_allocated != 8 && bits_allocated != 16 {
        bail!("BitsAllocated={} is not supported (only 8/16)", bits_allocated);
    }

    match samples_per_pixel {
        1 => {
            let mono_pixels: Vec<i32> = decoded
                .to_vec_frame(0)
                .context("Could not convert decoded frame 0 to i32 samples")?;
            if mono_pixels.len() != width * height {
                bail!(
                    "Decoded pixel count mismatch: got {}, expected {}",
                    mono_pixels.len(),
                    width * height
                );
            }

            let (min_value, max_value) =
                min_max(&mono_pixels).context("No pixels available for rendering")?;
            let window_center = read_float_first(obj, "WindowCenter")
                .unwrap_or_else(|| (min_value + max_value) as f32 / 2.0);
            let window_width = read_float_first(obj, "WindowWidth")
                .unwrap_or_else(|| (max_value - min_value).max(1) as f32);

            Ok(DecodedImage {
                width,
                height,
                color_mode: ColorMode::Monochrome,
                invert,
                window_center,
                window_width: window_width.max(1.0),
                min_value,
                max_value,
                samples_per_pixel,
                mono_pixels,
                rgb_pixels: Vec::new(),
            })
        }
        spp if spp >= 3 => {
            let bits_shift = decoded.bits_stored().saturating_sub(8);
            let rgb_pixels: Vec<u8> = if bits_allocated == 8 {
                decoded
                    .to_vec_frame(0)
                    .context("Could not convert decoded frame 0 to u8 samples")?
            } else {
                let samples_u16: Vec<u16> = decoded
                    .to_vec_frame(0)
                    .context("Could not convert decoded frame 0 to u16 samples")?;
                samples_u16
                    .into_iter()
                    .map(|sample| (sample >> bits_shift) as u8)
                    .collect()
            };

            let expected_len = width
                .checked_mul(height)
                .and_then(|v| v.checked_mul(spp as usize))
                .context("Overflow while calculating color frame size")?;
            if rgb_pixels.len() != expected_len {
                bail!(
                    "Decoded color pixel count mismatch: got {}, expected {}",
                    rgb_pixels.len(),
                    expected_len
                );
            }

            Ok(DecodedImage {
                width,
                height,
                color_mode: ColorMode::Rgb,
                invert: false,
                window_center: 127.5,
                window_width: 255.0,
                min_value: 0,
                max_value: 255,
                samples_per_pixel,
                mono_pixels: Vec::new(),
                rgb_pixels,
            })
        }
        other => bail!("Unsupported SamplesPerPixel={}", other),
    }
}

fn render_image(image: &DecodedImage, center: f32, width: f32) -> FramePixels {
    match image.color_mode {
        ColorMode::Monochrome => render_window_level(
            image.width,
            image.height,
            &image.mono_pixels,
            image.invert,
            center,
            width,
        ),
        ColorMode::Rgb => render_rgb(
            image.width,
            image.height,
            &image.rgb_pixels,
            image.samples_per_pixel,
        ),
    }
}

fn render_window_level(
    width_px: usize,
    height_px: usize,
    frame_pixels: &[i32],
    invert: bool,
    center: f32,
    width: f32,
) -> FramePixels {
    let effective_width = width.max(1.0);
    let low = center - effective_width / 2.0;
    let high = center + effective_width / 2.0;
    let range = (high - low).max(1e-6);

    let mut rgba = Vec::with_capacity(frame_pixels.len() * 4);
    for &sample in frame_pixels {
        let normalized = ((sample as f32 - low) / range).clamp(0.0, 1.0);
        let mut gray = (normalized * 255.0).round() as u8;
        if invert {
            gray = 255 - gray;
        }
        rgba.extend_from_slice(&[gray, gray, gray, 255]);
    }

    FramePixels {
        width: width_px,
        height: height_px,
        rgba,
    }
}

fn render_rgb(
    width_px: usize,
    height_px: usize,
    frame_pixels: &[u8],
    samples_per_pixel: u16,
) -> FramePixels {
    let spp = samples_per_pixel.max(1) as usize;
    let pixel_count = width_px.saturating_mul(height_px);
    let mut rgba = Vec::with_capacity(pixel_count * 4);

    for chunk in frame_pixels.chunks_exact(spp).take(pixel_count) {
        let r = chunk[0];
        let g = if spp > 1 { chunk[1] } else { r };
        let b = if spp > 2 { chunk[2] } else { r };
        rgba.extend_from_slice(&[r, g, b, 255]);
    }

    while rgba.len() < pixel_count * 4 {
        rgba.extend_from_slice(&[0, 0, 0, 255]);
    }

    FramePixels {
        width: width_px,
        height: height_px,
        rgba,
    }
}

fn read_string_or_default(obj: &DefaultDicomObject, name: &str, default: &str) -> String {
    obj.element_by_name(name)
        .ok()
        .and_then(|el| el.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| default.to_string())
}

fn read_float_first(obj: &DefaultDicomObject, name: &str) -> Option<f32> {
    obj.element_by_name(name)
        .ok()
        .and_then(|el| el.to_str().ok())
        .and_then(|value| value.split('\\').next()?.trim().parse::<f32>().ok())
}

fn min_max(values: &[i32]) -> Option<(i32, i32)> {
    let mut iter = values.iter().copied();
    let first = iter.next()?;
    let mut min_v = first;
    let mut max_v = first;
    for v in iter {
        if v < min_v {
            min_v = v;
        }
        if v > max_v {
            max_v = v;
        }
    }
    Some((min_v, max_v))
}
