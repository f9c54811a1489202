use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use eframe::egui::{self, ColorImage, Sense, TextureHandle, TextureOptions};

use crate::coordinator::{Layout, LoadTarget, MultiViewportCoordinator, SlotId};
use crate::engine::{FileRegistry, PointerButton, RenderEngine, SurfaceId, ViewportKind};
use crate::launch::ViewerPayload;
use crate::render::SoftwareEngine;
use crate::resolve::{register_local_files, HttpInstanceService};
use crate::selection::{LocalSeries, SeriesSelectionController, SeriesSource};

const APP_TITLE: &str = "Quadra Viewer";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const SIDEBAR_WIDTH: f32 = 220.0;
const THUMB_LIST_DIM: f32 = 56.0;

/// Texture identity per slot. The slot texture is re-uploaded only when this
/// changes.
#[derive(PartialEq, Clone, Copy)]
struct SlotFrameKey {
    surface: SurfaceId,
    slice: usize,
    stack_len: usize,
    window_bits: (u32, u32),
}

pub struct QuadraApp {
    registry: Arc<FileRegistry>,
    engine: Arc<SoftwareEngine>,
    coordinator: MultiViewportCoordinator,
    selection: SeriesSelectionController,
    pending_payload: Option<ViewerPayload>,
    auto_select_series: Option<String>,
    status_line: String,
    slot_textures: HashMap<SlotId, (SlotFrameKey, TextureHandle)>,
    thumb_textures: HashMap<String, TextureHandle>,
    slot_sizes: HashMap<SlotId, egui::Vec2>,
}

impl QuadraApp {
    pub fn new(payload: Option<ViewerPayload>, initial_status: Option<String>) -> Self {
        let registry = Arc::new(FileRegistry::new());
        let engine = Arc::new(SoftwareEngine::new(Arc::clone(&registry)));
        let engine_dyn: Arc<dyn RenderEngine> = Arc::clone(&engine) as Arc<dyn RenderEngine>;
        let mut coordinator =
            MultiViewportCoordinator::new(Arc::clone(&engine_dyn), ViewportKind::Stack);
        let mut status_line = initial_status.unwrap_or_default();
        if let Err(err) = coordinator.set_layout(Layout::Single) {
            status_line = format!("Could not create the initial viewport: {err:#}");
        }
        let selection = SeriesSelectionController::new(Arc::clone(&registry), engine_dyn);

        Self {
            registry,
            engine,
            coordinator,
            selection,
            pending_payload: payload,
            auto_select_series: None,
            status_line,
            slot_textures: HashMap::new(),
            thumb_textures: HashMap::new(),
            slot_sizes: HashMap::new(),
        }
    }

    fn consume_payload(&mut self) {
        let Some(payload) = self.pending_payload.take() else {
            return;
        };
        match payload {
            ViewerPayload::LocalPaths(paths) => {
                self.open_local_groups(vec![paths]);
            }
            ViewerPayload::LocalGroups { groups } => {
                self.open_local_groups(groups);
            }
            ViewerPayload::Study {
                base_url,
                patient_id,
                series_uid,
            } => match HttpInstanceService::new(&base_url) {
                Ok(service) => {
                    self.selection.set_service(Arc::new(service));
                    self.auto_select_series = series_uid;
                    self.selection.refresh(SeriesSource::Server { patient_id });
                    self.status_line = "Loading series list...".to_string();
                }
                Err(err) => {
                    self.status_line = format!("Study server error: {err:#}");
                }
            },
        }
    }

    fn open_local_groups(&mut self, groups: Vec<Vec<PathBuf>>) {
        let mut local = Vec::with_capacity(groups.len());
        for paths in &groups {
            match read_group(paths) {
                Ok((label, payloads)) => {
                    let references = register_local_files(&self.registry, &label, payloads);
                    local.push(LocalSeries { label, references });
                }
                Err(err) => {
                    self.status_line = format!("Could not open files: {err:#}");
                    return;
                }
            }
        }
        if local.is_empty() {
            self.status_line = "No DICOM files to open.".to_string();
            return;
        }

        self.coordinator
            .set_pending_stack(local[0].references.clone());
        self.selection.refresh(SeriesSource::Local { groups: local });
        // same layout; triggers the one-shot pending application
        if let Err(err) = self.coordinator.set_layout(self.coordinator.layout()) {
            self.status_line = format!("Viewport error: {err:#}");
        } else {
            self.status_line.clear();
        }
    }

    fn open_dicoms(&mut self) {
        let picked = rfd::FileDialog::new()
            .add_filter("DICOM", &["dcm"])
            .pick_files();
        if let Some(paths) = picked {
            if !paths.is_empty() {
                self.open_local_groups(vec![paths]);
            }
        }
    }

    fn auto_select_if_ready(&mut self) {
        let Some(uid) = self.auto_select_series.clone() else {
            return;
        };
        if self.selection.is_loading() {
            return;
        }
        self.auto_select_series = None;
        let index = self
            .selection
            .items()
            .iter()
            .position(|item| item.identifier == uid);
        match index {
            Some(index) => {
                if let Err(err) =
                    self.selection
                        .select(index, &mut self.coordinator, LoadTarget::Active)
                {
                    self.status_line = format!("Could not load series: {err:#}");
                }
            }
            None => {
                self.status_line = format!("Series {uid} was not found for this patient.");
            }
        }
    }

    fn set_layout(&mut self, layout: Layout) {
        if let Err(err) = self.coordinator.set_layout(layout) {
            self.status_line = format!("Layout change failed: {err:#}");
        }
        self.slot_textures.clear();
        self.slot_sizes.clear();
    }

    fn set_kind(&mut self, kind: ViewportKind) {
        if let Err(err) = self.coordinator.set_kind(kind) {
            self.status_line = format!("Viewport mode change failed: {err:#}");
        }
        self.slot_textures.clear();
    }

    fn show_toolbar(&mut self, ctx: &egui::Context) {
        let mut open_clicked = false;
        let mut new_layout = None;
        let mut new_kind = None;

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(format!("{APP_TITLE} v{APP_VERSION}"));
                ui.separator();
                if ui.button("Open DICOM(s)").clicked() {
                    open_clicked = true;
                }
                ui.separator();
                for (layout, label) in [(Layout::Single, "1\u{d7}1"), (Layout::Quad, "2\u{d7}2")] {
                    let selected = self.coordinator.layout() == layout;
                    if ui.selectable_label(selected, label).clicked() && !selected {
                        new_layout = Some(layout);
                    }
                }
                ui.separator();
                for kind in [
                    ViewportKind::Stack,
                    ViewportKind::Volume,
                    ViewportKind::Volume3d,
                ] {
                    let selected = self.coordinator.kind() == kind;
                    if ui.selectable_label(selected, kind.label()).clicked() && !selected {
                        new_kind = Some(kind);
                    }
                }
            });
        });

        if open_clicked {
            self.open_dicoms();
        }
        if let Some(layout) = new_layout {
            self.set_layout(layout);
        }
        if let Some(kind) = new_kind {
            self.set_kind(kind);
        }
    }

    fn show_sidebar(&mut self, ctx: &egui::Context) {
        let mut clicked_index = None;
        egui::SidePanel::left("series")
            .exact_width(SIDEBAR_WIDTH)
            .show(ctx, |ui| {
                ui.add_space(4.0);
                ui.heading("Series");
                if self.selection.is_loading() {
                    ui.spinner();
                }
                ui.separator();
                egui::ScrollArea::vertical().show(ui, |ui| {
                    for (index, item) in self.selection.items().iter().enumerate() {
                        let selected = self.selection.selected() == Some(index);
                        let response = ui
                            .push_id(index, |ui| {
                                ui.horizontal(|ui| {
                                    if let Some(texture) = thumb_texture(
                                        ctx,
                                        &mut self.thumb_textures,
                                        &item.identifier,
                                        item.thumbnail.as_deref(),
                                    ) {
                                        ui.image((
                                            texture.id(),
                                            fit_size(texture.size_vec2(), THUMB_LIST_DIM),
                                        ));
                                    } else {
                                        let (rect, _) = ui.allocate_exact_size(
                                            egui::Vec2::splat(THUMB_LIST_DIM),
                                            Sense::hover(),
                                        );
                                        ui.painter().rect_filled(
                                            rect,
                                            2.0,
                                            ui.visuals().faint_bg_color,
                                        );
                                        ui.painter().text(
                                            rect.center(),
                                            egui::Align2::CENTER_CENTER,
                                            if item.error.is_some() { "!" } else { "?" },
                                            egui::FontId::proportional(18.0),
                                            ui.visuals().weak_text_color(),
                                        );
                                    }
                                    ui.vertical(|ui| {
                                        let title = if item.description.is_empty() {
                                            item.identifier.clone()
                                        } else {
                                            item.description.clone()
                                        };
                                        if ui.selectable_label(selected, title).clicked() {
                                            clicked_index = Some(index);
                                        }
                                        ui.weak(format!(
                                            "#{} \u{b7} {} image(s)",
                                            item.number, item.instance_count
                                        ));
                                        if let Some(error) = &item.error {
                                            ui.colored_label(
                                                ui.visuals().warn_fg_color,
                                                truncate(error, 40),
                                            );
                                        }
                                    });
                                });
                            })
                            .response;
                        let response = response.interact(Sense::click());
                        if response.clicked() {
                            clicked_index = Some(index);
                        }
                        ui.separator();
                    }
                });
            });

        if let Some(index) = clicked_index {
            if let Err(err) =
                self.selection
                    .select(index, &mut self.coordinator, LoadTarget::Active)
            {
                self.status_line = format!("Could not load series: {err:#}");
            }
        }
    }

    fn show_status_bar(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if self.status_line.is_empty() {
                    let slot = self.coordinator.active_slot();
                    if let Some(surface) = self.coordinator.slot_surface(slot) {
                        if let Some((slice, total)) = self.engine.slice_position(surface) {
                            ui.weak(format!(
                                "{} \u{b7} slice {}/{total}",
                                self.coordinator.kind().label(),
                                slice + 1
                            ));
                        }
                    }
                } else {
                    ui.label(&self.status_line);
                }
            });
        });
    }

    fn show_viewports(&mut self, ctx: &egui::Context) {
        egui::CentralPanel::default().show(ctx, |ui| {
            let area = ui.available_rect_before_wrap();
            let slots = self.coordinator.visible_slots();
            for (slot, rect) in slot_rects(area, self.coordinator.layout(), slots) {
                self.show_slot(ui, slot, rect);
            }
        });
    }

    fn show_slot(&mut self, ui: &mut egui::Ui, slot: SlotId, rect: egui::Rect) {
        let Some(surface) = self.coordinator.slot_surface(slot) else {
            return;
        };

        let response = ui.interact(
            rect,
            egui::Id::new(("viewport", slot)),
            Sense::click_and_drag(),
        );
        if response.clicked() {
            self.coordinator.set_active_slot(slot);
        }
        for (egui_button, button) in [
            (egui::PointerButton::Primary, PointerButton::Primary),
            (egui::PointerButton::Secondary, PointerButton::Secondary),
            (egui::PointerButton::Middle, PointerButton::Auxiliary),
        ] {
            if response.dragged_by(egui_button) {
                let delta = response.drag_delta();
                if delta != egui::Vec2::ZERO {
                    self.coordinator.set_active_slot(slot);
                    self.engine.pointer_drag(surface, button, (delta.x, delta.y));
                }
            }
        }
        if response.hovered() {
            let scroll = ui.input(|input| input.raw_scroll_delta.y);
            if scroll.abs() > 0.5 {
                let steps = if scroll < 0.0 { 1 } else { -1 };
                self.engine.wheel_scroll(surface, steps);
            }
        }

        // panel-size tracking stands in for a resize observer
        let previous = self.slot_sizes.insert(slot, rect.size());
        if previous.is_some_and(|size| size != rect.size()) {
            self.engine.notify_resize(surface);
        }

        ui.painter().rect_filled(rect, 0.0, egui::Color32::BLACK);

        if let Some(texture) = self.slot_texture(ui.ctx(), slot, surface) {
            let (zoom, pan, rotation) = self
                .engine
                .view_transform(surface)
                .unwrap_or((1.0, (0.0, 0.0), 0.0));
            let base = fit_size(texture.size_vec2(), rect.width().min(rect.height()));
            let size = base * zoom;
            let center = rect.center() + egui::vec2(pan.0, pan.1);
            let image_rect = egui::Rect::from_center_size(center, size);

            let mut content_ui = ui.new_child(egui::UiBuilder::new().max_rect(rect));
            content_ui.set_clip_rect(rect);
            let image = egui::Image::new((texture.id(), size))
                .rotate(rotation.to_radians(), egui::Vec2::splat(0.5));
            content_ui.put(image_rect, image);
        } else {
            ui.painter().text(
                rect.center(),
                egui::Align2::CENTER_CENTER,
                "No series loaded",
                egui::FontId::proportional(14.0),
                egui::Color32::DARK_GRAY,
            );
        }

        let active = self.coordinator.active_slot() == slot;
        let stroke = if active {
            egui::Stroke::new(2.0, egui::Color32::from_rgb(90, 150, 250))
        } else {
            egui::Stroke::new(1.0, egui::Color32::from_gray(60))
        };
        ui.painter().rect_stroke(rect.shrink(1.0), 0.0, stroke);
    }

    fn slot_texture(
        &mut self,
        ctx: &egui::Context,
        slot: SlotId,
        surface: SurfaceId,
    ) -> Option<TextureHandle> {
        let (slice, stack_len) = self.engine.slice_position(surface)?;
        let window = self.engine.window_of(surface).unwrap_or((0.0, 0.0));
        let key = SlotFrameKey {
            surface,
            slice,
            stack_len,
            window_bits: (window.0.to_bits(), window.1.to_bits()),
        };

        if let Some((cached_key, texture)) = self.slot_textures.get(&slot) {
            if *cached_key == key {
                return Some(texture.clone());
            }
        }

        let frame = match self.engine.surface_frame(surface) {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(err) => {
                self.status_line = format!("Render error: {err:#}");
                return None;
            }
        };
        let color_image =
            ColorImage::from_rgba_unmultiplied([frame.width, frame.height], &frame.rgba);
        let texture = ctx.load_texture(
            format!("slot-{}", slot.label()),
            color_image,
            TextureOptions::LINEAR,
        );
        self.slot_textures.insert(slot, (key, texture.clone()));
        Some(texture)
    }
}

impl eframe::App for QuadraApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.consume_payload();
        if let Err(err) = self.selection.poll(&mut self.coordinator) {
            self.status_line = format!("Load error: {err:#}");
        }
        if let Some(error) = self.selection.last_error() {
            if self.status_line.is_empty() {
                self.status_line = error.to_string();
            }
        }
        self.auto_select_if_ready();

        self.show_toolbar(ctx);
        self.show_sidebar(ctx);
        self.show_status_bar(ctx);
        self.show_viewports(ctx);

        if self.selection.is_loading() {
            ctx.set_cursor_icon(egui::CursorIcon::Progress);
            ctx.request_repaint_after(std::time::Duration::from_millis(100));
        } else {
            ctx.set_cursor_icon(egui::CursorIcon::Default);
        }
    }
}

fn read_group(paths: &[PathBuf]) -> anyhow::Result<(String, Vec<Vec<u8>>)> {
    use anyhow::Context as _;

    let label = paths
        .first()
        .and_then(|path| path.file_stem())
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "local".to_string());
    let mut payloads = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes =
            fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
        payloads.push(bytes);
    }
    Ok((label, payloads))
}

fn thumb_texture(
    ctx: &egui::Context,
    cache: &mut HashMap<String, TextureHandle>,
    identifier: &str,
    data_uri: Option<&str>,
) -> Option<TextureHandle> {
    if let Some(texture) = cache.get(identifier) {
        return Some(texture.clone());
    }
    let uri = data_uri?;
    let encoded = uri.strip_prefix("data:image/jpeg;base64,")?;
    let jpeg = BASE64.decode(encoded).ok()?;
    let decoded = image::load_from_memory(&jpeg).ok()?.to_rgba8();
    let (width, height) = decoded.dimensions();
    let color_image = ColorImage::from_rgba_unmultiplied(
        [width as usize, height as usize],
        decoded.as_raw(),
    );
    let texture = ctx.load_texture(
        format!("thumb-{identifier}"),
        color_image,
        TextureOptions::LINEAR,
    );
    cache.insert(identifier.to_string(), texture.clone());
    Some(texture)
}

fn fit_size(image_size: egui::Vec2, max_dim: f32) -> egui::Vec2 {
    if image_size.x <= 0.0 || image_size.y <= 0.0 {
        return egui::Vec2::splat(max_dim);
    }
    let scale = (max_dim / image_size.x).min(max_dim / image_size.y);
    image_size * scale
}

fn slot_rects(
    area: egui::Rect,
    layout: Layout,
    slots: &[SlotId],
) -> Vec<(SlotId, egui::Rect)> {
    match layout {
        Layout::Single => vec![(slots[0], area)],
        Layout::Quad => {
            let half = area.size() / 2.0;
            slots
                .iter()
                .enumerate()
                .map(|(index, slot)| {
                    let col = (index % 2) as f32;
                    let row = (index / 2) as f32;
                    let min = area.min + egui::vec2(col * half.x, row * half.y);
                    (*slot, egui::Rect::from_min_size(min, half))
                })
                .collect()
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}\u{2026}")
}
