use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::coordinator::{LoadTarget, LoadTicket, MultiViewportCoordinator};
use crate::engine::{FileRegistry, ImageReference, RenderEngine};
use crate::resolve::{resolve_series, InstanceService, ResolveError, SeriesMeta};
use crate::thumbs::ThumbnailCache;

const THUMB_MAX_SIZE: u32 = 96;

/// What the sidebar lists: a server patient's series, or locally opened file
/// bundles. Tagged so the two cases can never be confused.
#[derive(Clone)]
pub enum SeriesSource {
    Server { patient_id: String },
    Local { groups: Vec<LocalSeries> },
}

#[derive(Clone)]
pub struct LocalSeries {
    pub label: String,
    pub references: Vec<ImageReference>,
}

#[derive(Clone)]
pub struct SeriesItem {
    pub identifier: String,
    pub number: u32,
    pub description: String,
    pub instance_count: usize,
    pub thumbnail: Option<String>,
    /// Reference list cached after first successful resolution.
    pub references: Option<Vec<ImageReference>>,
    pub error: Option<String>,
}

enum ControllerMessage {
    Refreshed {
        generation: u64,
        result: Result<Vec<SeriesItem>>,
    },
    Resolved {
        generation: u64,
        index: usize,
        ticket: LoadTicket,
        result: Result<Vec<ImageReference>, ResolveError>,
    },
}

/// Drives the series sidebar. Every refresh bumps a generation counter and
/// spawns one worker; results are tagged with the generation they were started
/// under and only the current generation commits, so a refresh issued while an
/// older one is in flight can never be overwritten by it.
pub struct SeriesSelectionController {
    service: Option<Arc<dyn InstanceService>>,
    registry: Arc<FileRegistry>,
    engine: Arc<dyn RenderEngine>,
    thumbs: ThumbnailCache,
    items: Vec<SeriesItem>,
    selected: Option<usize>,
    generation: u64,
    loading: bool,
    last_error: Option<String>,
    sender: Sender<ControllerMessage>,
    receiver: Receiver<ControllerMessage>,
}

impl SeriesSelectionController {
    pub fn new(registry: Arc<FileRegistry>, engine: Arc<dyn RenderEngine>) -> Self {
        let (sender, receiver) = channel();
        Self {
            service: None,
            registry,
            engine,
            thumbs: ThumbnailCache::new(),
            items: Vec::new(),
            selected: None,
            generation: 0,
            loading: false,
            last_error: None,
            sender,
            receiver,
        }
    }

    pub fn set_service(&mut self, service: Arc<dyn InstanceService>) {
        self.service = Some(service);
    }

    pub fn items(&self) -> &[SeriesItem] {
        &self.items
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Starts a refresh for `source`. Any in-flight refresh keeps running but
    /// its result will arrive under a stale generation and be dropped.
    pub fn refresh(&mut self, source: SeriesSource) {
        self.generation += 1;
        self.loading = true;
        self.last_error = None;
        self.selected = None;

        let generation = self.generation;
        let sender = self.sender.clone();
        let service = self.service.clone();
        let registry = Arc::clone(&self.registry);
        let engine = Arc::clone(&self.engine);
        let thumbs = self.thumbs.clone();
        std::thread::spawn(move || {
            let result = build_items(&source, service.as_deref(), &registry, &*engine, &thumbs);
            // receiver gone means the controller was dropped
            let _ = sender.send(ControllerMessage::Refreshed { generation, result });
        });
    }

    /// Selects an item and routes its stack to the coordinator. A cached
    /// reference list loads immediately; otherwise a resolver worker runs and
    /// the result commits through the load ticket, so a later selection always
    /// wins over an earlier one that finishes late.
    pub fn select(
        &mut self,
        index: usize,
        coordinator: &mut MultiViewportCoordinator,
        target: LoadTarget,
    ) -> Result<()> {
        let Some(item) = self.items.get(index) else {
            return Ok(());
        };
        self.selected = Some(index);

        if let Some(references) = item.references.clone() {
            return coordinator.load_into(&references, target);
        }

        let Some(service) = self.service.clone() else {
            return Err(anyhow!("no study server configured"));
        };
        let ticket = coordinator.begin_load(target);
        let generation = self.generation;
        let series_uid = item.identifier.clone();
        let sender = self.sender.clone();
        let registry = Arc::clone(&self.registry);
        std::thread::spawn(move || {
            let result = resolve_series(&*service, &registry, &series_uid);
            let _ = sender.send(ControllerMessage::Resolved {
                generation,
                index,
                ticket,
                result,
            });
        });
        Ok(())
    }

    /// Drains finished worker messages. Called once per frame.
    pub fn poll(&mut self, coordinator: &mut MultiViewportCoordinator) -> Result<()> {
        while let Ok(message) = self.receiver.try_recv() {
            self.apply_message(message, coordinator)?;
        }
        Ok(())
    }

    fn apply_message(
        &mut self,
        message: ControllerMessage,
        coordinator: &mut MultiViewportCoordinator,
    ) -> Result<()> {
        match message {
            ControllerMessage::Refreshed { generation, result } => {
                if generation != self.generation {
                    log::debug!(
                        "dropping stale series refresh (generation {generation}, current {})",
                        self.generation
                    );
                    return Ok(());
                }
                self.loading = false;
                match result {
                    Ok(items) => self.items = items,
                    Err(err) => {
                        self.items.clear();
                        self.last_error = Some(format!("{err:#}"));
                    }
                }
            }
            ControllerMessage::Resolved {
                generation,
                index,
                ticket,
                result,
            } => {
                if generation != self.generation {
                    log::debug!("dropping resolution finished under a stale generation");
                    return Ok(());
                }
                match result {
                    Ok(references) => {
                        if let Some(item) = self.items.get_mut(index) {
                            item.references = Some(references.clone());
                            item.error = None;
                        }
                        coordinator.commit_load(&ticket, &references)?;
                    }
                    Err(err) => {
                        if let Some(item) = self.items.get_mut(index) {
                            item.error = Some(format!("{err:#}"));
                        }
                        self.last_error = Some(format!("{err:#}"));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Builds the sidebar items for one refresh cycle. Per-item failures degrade
/// that item to a placeholder without failing the cycle; only a failed series
/// listing fails the whole refresh.
fn build_items(
    source: &SeriesSource,
    service: Option<&dyn InstanceService>,
    registry: &FileRegistry,
    engine: &dyn RenderEngine,
    thumbs: &ThumbnailCache,
) -> Result<Vec<SeriesItem>> {
    match source {
        SeriesSource::Local { groups } => Ok(groups
            .iter()
            .enumerate()
            .map(|(index, group)| local_item(index, group, engine, thumbs))
            .collect()),
        SeriesSource::Server { patient_id } => {
            let service = service.ok_or_else(|| anyhow!("no study server configured"))?;
            let series = service.fetch_series(patient_id)?;
            Ok(series
                .iter()
                .map(|meta| server_item(meta, service, registry, engine, thumbs))
                .collect())
        }
    }
}

fn local_item(
    index: usize,
    group: &LocalSeries,
    engine: &dyn RenderEngine,
    thumbs: &ThumbnailCache,
) -> SeriesItem {
    // group index keeps identifiers apart when two groups share a file stem
    let mut item = SeriesItem {
        identifier: format!("{}-{}", index + 1, group.label),
        number: index as u32 + 1,
        description: group.label.clone(),
        instance_count: group.references.len(),
        thumbnail: None,
        references: Some(group.references.clone()),
        error: None,
    };
    if let Some(first) = group.references.first() {
        match thumbs.ensure(&item.identifier, engine, first, THUMB_MAX_SIZE) {
            Ok(uri) => item.thumbnail = Some(uri),
            Err(err) => {
                log::warn!("thumbnail for {} failed: {err:#}", item.identifier);
                item.error = Some(format!("{err:#}"));
            }
        }
    }
    item
}

fn server_item(
    meta: &SeriesMeta,
    service: &dyn InstanceService,
    registry: &FileRegistry,
    engine: &dyn RenderEngine,
    thumbs: &ThumbnailCache,
) -> SeriesItem {
    let mut item = SeriesItem {
        identifier: meta.series_instance_uid.clone(),
        number: meta.series_number,
        description: meta.series_description.clone(),
        instance_count: 0,
        thumbnail: None,
        references: None,
        error: None,
    };

    let urls = match service.fetch_instance_list(&meta.series_instance_uid) {
        Ok(urls) => urls,
        Err(err) => {
            log::warn!("instance list for {} failed: {err:#}", item.identifier);
            item.error = Some(format!("{err:#}"));
            return item;
        }
    };
    item.instance_count = urls.len();

    // preview from the first instance only; the full stack resolves on click
    if let Some(uri) = thumbs.get(&item.identifier) {
        item.thumbnail = Some(uri);
    } else if let Some(first_url) = urls.first() {
        let preview = service
            .fetch_instance(first_url)
            .map(|bytes| registry.register(&format!("{}-preview.dcm", item.identifier), bytes))
            .and_then(|reference| thumbs.ensure(&item.identifier, engine, &reference, THUMB_MAX_SIZE));
        match preview {
            Ok(uri) => item.thumbnail = Some(uri),
            Err(err) => {
                log::warn!("thumbnail for {} failed: {err:#}", item.identifier);
                item.error = Some(format!("{err:#}"));
            }
        }
    }
    item
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Layout, SlotId};
    use crate::engine::testing::RecordingEngine;
    use crate::engine::ViewportKind;
    use anyhow::bail;
    use std::collections::HashMap;

    struct InMemoryService {
        series: Vec<SeriesMeta>,
        instance_urls: HashMap<String, Vec<String>>,
        payloads: HashMap<String, Vec<u8>>,
    }

    impl InMemoryService {
        fn new() -> Self {
            Self {
                series: Vec::new(),
                instance_urls: HashMap::new(),
                payloads: HashMap::new(),
            }
        }

        fn add_series(&mut self, uid: &str, number: u32, urls: &[&str]) {
            self.series.push(SeriesMeta {
                series_instance_uid: uid.to_string(),
                series_number: number,
                series_description: format!("series {number}"),
            });
            self.instance_urls
                .insert(uid.to_string(), urls.iter().map(|url| url.to_string()).collect());
            for url in urls {
                self.payloads.insert(url.to_string(), vec![0u8]);
            }
        }
    }

    impl InstanceService for InMemoryService {
        fn fetch_series(&self, _patient_id: &str) -> Result<Vec<SeriesMeta>> {
            Ok(self.series.clone())
        }

        fn fetch_instance_list(&self, series_uid: &str) -> Result<Vec<String>> {
            self.instance_urls
                .get(series_uid)
                .cloned()
                .ok_or_else(|| anyhow!("unknown series {series_uid}"))
        }

        fn fetch_instance(&self, url: &str) -> Result<Vec<u8>> {
            if url.contains("broken") {
                bail!("simulated transfer failure");
            }
            self.payloads
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow!("unknown url {url}"))
        }
    }

    fn setup() -> (
        Arc<FileRegistry>,
        Arc<RecordingEngine>,
        SeriesSelectionController,
        MultiViewportCoordinator,
    ) {
        let registry = Arc::new(FileRegistry::new());
        let engine = Arc::new(RecordingEngine::new());
        let controller = SeriesSelectionController::new(
            Arc::clone(&registry),
            Arc::clone(&engine) as Arc<dyn RenderEngine>,
        );
        let mut coordinator = MultiViewportCoordinator::new(
            Arc::clone(&engine) as Arc<dyn RenderEngine>,
            ViewportKind::Stack,
        );
        coordinator.set_layout(Layout::Single).expect("layout");
        (registry, engine, controller, coordinator)
    }

    fn wait_for<F: Fn(&SeriesSelectionController) -> bool>(
        controller: &mut SeriesSelectionController,
        coordinator: &mut MultiViewportCoordinator,
        done: F,
    ) {
        for _ in 0..200 {
            controller.poll(coordinator).expect("poll");
            if done(controller) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("timed out waiting for controller state");
    }

    #[test]
    fn refresh_populates_items_with_thumbnails_and_counts() {
        let (_registry, _engine, mut controller, mut coordinator) = setup();
        let mut service = InMemoryService::new();
        service.add_series("1.2.3", 1, &["http://s/a0", "http://s/a1"]);
        service.add_series("4.5.6", 2, &["http://s/b0"]);
        controller.set_service(Arc::new(service));

        controller.refresh(SeriesSource::Server {
            patient_id: "p1".to_string(),
        });
        wait_for(&mut controller, &mut coordinator, |c| !c.is_loading());

        let items = controller.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].instance_count, 2);
        assert_eq!(items[1].instance_count, 1);
        assert!(items[0]
            .thumbnail
            .as_deref()
            .is_some_and(|uri| uri.starts_with("data:image/jpeg;base64,")));
    }

    #[test]
    fn stale_refresh_result_never_overwrites_the_current_one() {
        let (_registry, _engine, mut controller, mut coordinator) = setup();

        // simulate a worker from an earlier cycle finishing late
        controller.generation = 2;
        let stale = ControllerMessage::Refreshed {
            generation: 1,
            result: Ok(vec![SeriesItem {
                identifier: "stale".to_string(),
                number: 1,
                description: "stale".to_string(),
                instance_count: 0,
                thumbnail: None,
                references: None,
                error: None,
            }]),
        };
        controller
            .apply_message(stale, &mut coordinator)
            .expect("apply");
        assert!(controller.items().is_empty());

        let current = ControllerMessage::Refreshed {
            generation: 2,
            result: Ok(vec![SeriesItem {
                identifier: "current".to_string(),
                number: 1,
                description: "current".to_string(),
                instance_count: 3,
                thumbnail: None,
                references: None,
                error: None,
            }]),
        };
        controller
            .apply_message(current, &mut coordinator)
            .expect("apply");
        assert_eq!(controller.items().len(), 1);
        assert_eq!(controller.items()[0].identifier, "current");
    }

    #[test]
    fn one_broken_thumbnail_does_not_block_siblings() {
        let (_registry, _engine, mut controller, mut coordinator) = setup();
        let mut service = InMemoryService::new();
        service.add_series("1.2.3", 1, &["http://s/broken0"]);
        service.add_series("4.5.6", 2, &["http://s/b0"]);
        controller.set_service(Arc::new(service));

        controller.refresh(SeriesSource::Server {
            patient_id: "p1".to_string(),
        });
        wait_for(&mut controller, &mut coordinator, |c| !c.is_loading());

        let items = controller.items();
        assert_eq!(items.len(), 2);
        assert!(items[0].thumbnail.is_none());
        assert!(items[0].error.is_some());
        assert!(items[1].thumbnail.is_some());
    }

    #[test]
    fn a_second_refresh_reuses_cached_previews() {
        let (registry, _engine, mut controller, mut coordinator) = setup();
        let mut service = InMemoryService::new();
        service.add_series("1.2.3", 1, &["http://s/a0"]);
        controller.set_service(Arc::new(service));

        controller.refresh(SeriesSource::Server {
            patient_id: "p1".to_string(),
        });
        wait_for(&mut controller, &mut coordinator, |c| !c.is_loading());
        let registered_after_first = registry.len();
        assert!(controller.items()[0].thumbnail.is_some());

        // the preview is served from the thumbnail cache, so no instance is
        // fetched or registered again
        controller.refresh(SeriesSource::Server {
            patient_id: "p1".to_string(),
        });
        wait_for(&mut controller, &mut coordinator, |c| !c.is_loading());
        assert_eq!(registry.len(), registered_after_first);
        assert!(controller.items()[0].thumbnail.is_some());
    }

    #[test]
    fn two_local_groups_keep_distinct_items_and_load_on_click() {
        let (registry, _engine, mut controller, mut coordinator) = setup();
        let first: Vec<_> = (0..3)
            .map(|index| registry.register(&format!("scan-{index}.dcm"), vec![index as u8]))
            .collect();
        let second: Vec<_> = (0..2)
            .map(|index| registry.register(&format!("scan-{index}.dcm"), vec![10 + index as u8]))
            .collect();

        // both groups carry the same file-stem label
        controller.refresh(SeriesSource::Local {
            groups: vec![
                LocalSeries {
                    label: "scan".to_string(),
                    references: first.clone(),
                },
                LocalSeries {
                    label: "scan".to_string(),
                    references: second,
                },
            ],
        });
        wait_for(&mut controller, &mut coordinator, |c| !c.is_loading());

        let items = controller.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].instance_count, 3);
        assert_eq!(items[1].instance_count, 2);
        assert_ne!(items[0].identifier, items[1].identifier);

        controller
            .select(0, &mut coordinator, LoadTarget::Active)
            .expect("select");
        assert_eq!(coordinator.slot_stack(SlotId::First), Some(&first[..]));
    }

    #[test]
    fn selecting_a_cached_local_series_loads_immediately() {
        let (registry, _engine, mut controller, mut coordinator) = setup();
        let references = vec![
            registry.register("a-0.dcm", vec![0]),
            registry.register("a-1.dcm", vec![1]),
        ];
        controller.refresh(SeriesSource::Local {
            groups: vec![LocalSeries {
                label: "local study".to_string(),
                references: references.clone(),
            }],
        });
        wait_for(&mut controller, &mut coordinator, |c| !c.is_loading());

        controller
            .select(0, &mut coordinator, LoadTarget::Active)
            .expect("select");
        assert_eq!(
            coordinator.slot_stack(SlotId::First),
            Some(&references[..])
        );
        assert_eq!(controller.selected(), Some(0));
    }

    #[test]
    fn late_resolution_of_a_superseded_selection_is_discarded() {
        let (registry, _engine, mut controller, mut coordinator) = setup();

        controller.items = vec![
            SeriesItem {
                identifier: "slow".to_string(),
                number: 1,
                description: String::new(),
                instance_count: 1,
                thumbnail: None,
                references: None,
                error: None,
            },
            SeriesItem {
                identifier: "fast".to_string(),
                number: 2,
                description: String::new(),
                instance_count: 1,
                thumbnail: None,
                references: Some(vec![registry.register("fast-0.dcm", vec![2])]),
                error: None,
            },
        ];

        // first selection's resolver is still running when the second lands
        let slow_ticket = coordinator.begin_load(LoadTarget::Active);
        controller
            .select(1, &mut coordinator, LoadTarget::Active)
            .expect("select fast");
        let fast_stack = coordinator
            .slot_stack(SlotId::First)
            .expect("fast stack applied")
            .to_vec();

        let slow_references = vec![registry.register("slow-0.dcm", vec![9])];
        let late = ControllerMessage::Resolved {
            generation: controller.generation,
            index: 0,
            ticket: slow_ticket,
            result: Ok(slow_references),
        };
        controller
            .apply_message(late, &mut coordinator)
            .expect("apply");

        assert_eq!(coordinator.slot_stack(SlotId::First), Some(&fast_stack[..]));
    }
}
