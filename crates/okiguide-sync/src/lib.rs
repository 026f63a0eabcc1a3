//! Guide list synchronization: collection store, pagination and the event orchestrator.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use okiguide_core::{FilterInputReader, FilterSpec, Guide, GuideFilter, PAGE_SIZE};
use okiguide_storage::{
    BookmarkStore, FetchOutcome, GuideSource, HttpClientConfig, HttpGuideSource,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "okiguide-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub fetch_timeout: Duration,
    pub poll: PollSchedule,
    pub bookmarks_path: PathBuf,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = PollSchedule::default();
        Self {
            api_url: std::env::var("OKIGUIDE_API_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000/api/guides".to_string()),
            fetch_timeout: Duration::from_secs(env_secs("OKIGUIDE_FETCH_TIMEOUT_SECS").unwrap_or(5)),
            poll: PollSchedule {
                small: env_secs("OKIGUIDE_POLL_SMALL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.small),
                medium: env_secs("OKIGUIDE_POLL_MEDIUM_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.medium),
                large: env_secs("OKIGUIDE_POLL_LARGE_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.large),
                ..defaults
            },
            bookmarks_path: std::env::var("OKIGUIDE_BOOKMARKS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/bookmarks.json")),
            user_agent: std::env::var("OKIGUIDE_USER_AGENT")
                .unwrap_or_else(|_| "okiguide/0.1".to_string()),
        }
    }

    pub fn http_source(&self) -> Result<HttpGuideSource> {
        HttpGuideSource::new(
            self.api_url.clone(),
            HttpClientConfig {
                timeout: self.fetch_timeout,
                user_agent: Some(self.user_agent.clone()),
                ..Default::default()
            },
        )
    }
}

fn env_secs(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub small_limit: usize,
    pub medium_limit: usize,
    pub small: Duration,
    pub medium: Duration,
    pub large: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            small_limit: 50,
            medium_limit: 200,
            small: Duration::from_secs(30),
            medium: Duration::from_secs(60),
            large: Duration::from_secs(180),
        }
    }
}

impl PollSchedule {
    pub fn interval_for(&self, guide_count: usize) -> Duration {
        if guide_count < self.small_limit {
            self.small
        } else if guide_count < self.medium_limit {
            self.medium
        } else {
            self.large
        }
    }
}

/// 1-based "X-Y of Z" range. `(0, 0, 0)` only when there is nothing to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayRange {
    pub start: usize,
    pub end: usize,
    pub total: usize,
}

impl DisplayRange {
    pub const EMPTY: Self = Self {
        start: 0,
        end: 0,
        total: 0,
    };

    pub fn label(&self) -> String {
        format!("{}-{} of {}", self.start, self.end, self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlice<'a, T> {
    pub items: &'a [T],
    pub range: DisplayRange,
    pub page: usize,
    pub total_pages: usize,
}

impl<T> PageSlice<'_, T> {
    pub fn is_no_results(&self) -> bool {
        self.range.total == 0
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

pub fn total_pages(total: usize, page_size: usize) -> usize {
    total.div_ceil(page_size.max(1)).max(1)
}

/// Slice one page out of `source`. A page past the end is pulled back to the last page.
pub fn paginate<T>(source: &[T], requested_page: usize, page_size: usize) -> PageSlice<'_, T> {
    let page_size = page_size.max(1);
    let total = source.len();
    let total_pages = total_pages(total, page_size);
    let page = requested_page.clamp(1, total_pages);

    if total == 0 {
        return PageSlice {
            items: &source[0..0],
            range: DisplayRange::EMPTY,
            page,
            total_pages,
        };
    }

    let start = (page - 1) * page_size;
    let end = (start + page_size).min(total);
    PageSlice {
        items: &source[start..end],
        range: DisplayRange {
            start: start + 1,
            end,
            total,
        },
        page,
        total_pages,
    }
}

#[derive(Debug, Clone)]
struct ActiveFilter {
    spec: FilterSpec,
    predicate: GuideFilter,
    matches: Vec<Guide>,
}

impl ActiveFilter {
    fn build(spec: FilterSpec, full: &[Guide]) -> Self {
        let predicate = spec.compile();
        let matches = full.iter().filter(|g| predicate.matches(g)).cloned().collect();
        Self {
            spec,
            predicate,
            matches,
        }
    }

    fn rederive(&mut self, full: &[Guide]) {
        self.matches = full
            .iter()
            .filter(|g| self.predicate.matches(g))
            .cloned()
            .collect();
    }
}

/// Guide lists and the page cursor. The pagination source is read off the filter
/// state on every call.
#[derive(Debug, Clone)]
pub struct GuideCollection {
    full: Vec<Guide>,
    filter: Option<ActiveFilter>,
    current_page: usize,
    page_size: usize,
}

impl Default for GuideCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl GuideCollection {
    pub fn new() -> Self {
        Self::with_page_size(PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            full: Vec::new(),
            filter: None,
            current_page: 1,
            page_size: page_size.max(1),
        }
    }

    pub fn set_full_list(&mut self, guides: Vec<Guide>) {
        self.full = guides;
        if let Some(filter) = &mut self.filter {
            filter.rederive(&self.full);
        }
        self.current_page = 1;
    }

    pub fn apply_filter(&mut self, spec: FilterSpec) {
        self.filter = Some(ActiveFilter::build(spec, &self.full));
        self.current_page = 1;
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
        self.current_page = 1;
    }

    /// Background refresh: swap the full list, re-run the stored predicate and keep the
    /// page, clamped to the new total.
    pub fn refresh_full_list(&mut self, guides: Vec<Guide>) {
        self.full = guides;
        if let Some(filter) = &mut self.filter {
            filter.rederive(&self.full);
        }
        self.current_page = self.clamp_page(self.current_page);
    }

    pub fn go_to_page(&mut self, page: usize) {
        self.current_page = self.clamp_page(page);
    }

    fn clamp_page(&self, page: usize) -> usize {
        page.clamp(1, self.total_pages())
    }

    pub fn full_list(&self) -> &[Guide] {
        &self.full
    }

    pub fn filtered_list(&self) -> Option<&[Guide]> {
        self.filter.as_ref().map(|f| f.matches.as_slice())
    }

    pub fn active_filter(&self) -> Option<&FilterSpec> {
        self.filter.as_ref().map(|f| &f.spec)
    }

    pub fn is_filtered(&self) -> bool {
        self.filter.is_some()
    }

    pub fn pagination_source(&self) -> &[Guide] {
        match &self.filter {
            Some(filter) => &filter.matches,
            None => &self.full,
        }
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn total_pages(&self) -> usize {
        total_pages(self.pagination_source().len(), self.page_size)
    }

    pub fn current_page_view(&self) -> PageSlice<'_, Guide> {
        paginate(self.pagination_source(), self.current_page, self.page_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    Loading,
    Results,
    NoResults,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderFrame<'a> {
    pub state: ViewState,
    pub items: &'a [Guide],
    pub range: DisplayRange,
    pub page: usize,
    pub total_pages: usize,
    pub filtered: bool,
}

impl<'a> RenderFrame<'a> {
    pub fn settled(collection: &'a GuideCollection) -> Self {
        let view = collection.current_page_view();
        let state = if view.is_no_results() {
            ViewState::NoResults
        } else {
            ViewState::Results
        };
        Self {
            state,
            items: view.items,
            range: view.range,
            page: view.page,
            total_pages: view.total_pages,
            filtered: collection.is_filtered(),
        }
    }
}

pub trait RenderTarget {
    fn render(&mut self, frame: &RenderFrame<'_>);

    fn mark_bookmark(&mut self, _guide_id: &str, _bookmarked: bool) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Initial,
    Background,
    Reload,
}

/// Issued with every fetch; a completion is applied only if its generation is newer
/// than the last one applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub generation: u64,
    pub kind: FetchKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    InitialLoad { guides: usize },
    Refreshed { guides: usize, page: usize },
    Unchanged,
    KeptCurrent { reason: String },
    StaleDiscarded { generation: u64 },
    Filtered { matches: usize },
    FilterCleared,
    PageChanged { page: usize },
    PageUnchanged,
    BookmarkToggled { guide_id: String, bookmarked: bool },
}

pub struct GuideListOrchestrator<R> {
    collection: GuideCollection,
    render: R,
    loaded: bool,
    issued_generation: u64,
    applied_generation: u64,
    in_flight: usize,
    last_fingerprint: Option<String>,
    bookmarks: BTreeSet<String>,
}

impl<R: RenderTarget> GuideListOrchestrator<R> {
    pub fn new(render: R) -> Self {
        Self::with_collection(GuideCollection::new(), render)
    }

    pub fn with_collection(collection: GuideCollection, render: R) -> Self {
        Self {
            collection,
            render,
            loaded: false,
            issued_generation: 0,
            applied_generation: 0,
            in_flight: 0,
            last_fingerprint: None,
            bookmarks: BTreeSet::new(),
        }
    }

    pub fn with_bookmarks(mut self, bookmarks: BTreeSet<String>) -> Self {
        self.bookmarks = bookmarks;
        self
    }

    pub fn start(&mut self) -> FetchTicket {
        self.emit();
        self.issue(FetchKind::Initial)
    }

    pub fn begin_poll(&mut self) -> Option<FetchTicket> {
        if self.in_flight > 0 {
            debug!(in_flight = self.in_flight, "poll tick skipped; fetch already in flight");
            return None;
        }
        let kind = if self.loaded {
            FetchKind::Background
        } else {
            FetchKind::Initial
        };
        Some(self.issue(kind))
    }

    /// Explicit reload. Always issues; anything older still in flight becomes stale once
    /// this one lands.
    pub fn begin_reload(&mut self) -> FetchTicket {
        self.issue(FetchKind::Reload)
    }

    fn issue(&mut self, kind: FetchKind) -> FetchTicket {
        self.issued_generation += 1;
        self.in_flight += 1;
        FetchTicket {
            generation: self.issued_generation,
            kind,
        }
    }

    pub fn complete_fetch(&mut self, ticket: FetchTicket, outcome: FetchOutcome) -> SyncAction {
        self.in_flight = self.in_flight.saturating_sub(1);

        if ticket.generation <= self.applied_generation {
            debug!(
                generation = ticket.generation,
                applied = self.applied_generation,
                "discarding stale guide response"
            );
            return SyncAction::StaleDiscarded {
                generation: ticket.generation,
            };
        }

        let snapshot = match outcome {
            FetchOutcome::Loaded(snapshot) => snapshot,
            FetchOutcome::Unavailable(reason) => {
                warn!(generation = ticket.generation, kind = ?ticket.kind, %reason, "guide refresh failed; keeping current view");
                return SyncAction::KeptCurrent { reason };
            }
        };
        self.applied_generation = ticket.generation;

        if !self.loaded {
            let guides = snapshot.len();
            self.last_fingerprint = Some(snapshot.fingerprint().to_string());
            self.collection.set_full_list(snapshot.into_guides());
            self.loaded = true;
            info!(guides, "initial guide list loaded");
            self.emit();
            return SyncAction::InitialLoad { guides };
        }

        if self.last_fingerprint.as_deref() == Some(snapshot.fingerprint()) {
            debug!(generation = ticket.generation, "guide data unchanged");
            return SyncAction::Unchanged;
        }

        let guides = snapshot.len();
        self.last_fingerprint = Some(snapshot.fingerprint().to_string());
        self.collection.refresh_full_list(snapshot.into_guides());
        let page = self.collection.current_page();
        info!(guides, page, filtered = self.collection.is_filtered(), "guide list refreshed");
        self.emit();
        SyncAction::Refreshed { guides, page }
    }

    pub fn search(&mut self, spec: FilterSpec) -> SyncAction {
        if spec.is_empty() {
            return self.reset_filters();
        }
        self.collection.apply_filter(spec);
        let matches = self.collection.pagination_source().len();
        info!(matches, "filter applied");
        self.emit();
        SyncAction::Filtered { matches }
    }

    pub fn search_from(&mut self, reader: &dyn FilterInputReader) -> SyncAction {
        let spec = FilterSpec::from_inputs(&reader.read_filter_inputs());
        self.search(spec)
    }

    pub fn reset_filters(&mut self) -> SyncAction {
        self.collection.clear_filter();
        self.emit();
        SyncAction::FilterCleared
    }

    pub fn go_to_page(&mut self, page: usize) -> SyncAction {
        let before = self.collection.current_page();
        self.collection.go_to_page(page);
        let after = self.collection.current_page();
        if after == before {
            return SyncAction::PageUnchanged;
        }
        self.emit();
        SyncAction::PageChanged { page: after }
    }

    pub fn next_page(&mut self) -> SyncAction {
        self.go_to_page(self.collection.current_page() + 1)
    }

    pub fn prev_page(&mut self) -> SyncAction {
        self.go_to_page(self.collection.current_page().saturating_sub(1))
    }

    pub fn toggle_bookmark(&mut self, guide_id: &str) -> SyncAction {
        let bookmarked = if self.bookmarks.remove(guide_id) {
            false
        } else {
            self.bookmarks.insert(guide_id.to_string());
            true
        };
        self.render.mark_bookmark(guide_id, bookmarked);
        SyncAction::BookmarkToggled {
            guide_id: guide_id.to_string(),
            bookmarked,
        }
    }

    fn emit(&mut self) {
        let mut frame = RenderFrame::settled(&self.collection);
        if !self.loaded {
            frame.state = ViewState::Loading;
        }
        self.render.render(&frame);
    }

    pub fn collection(&self) -> &GuideCollection {
        &self.collection
    }

    pub fn bookmarks(&self) -> &BTreeSet<String> {
        &self.bookmarks
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn render_target(&self) -> &R {
        &self.render
    }

    pub fn render_target_mut(&mut self) -> &mut R {
        &mut self.render
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    Search(okiguide_core::FilterInputs),
    ResetFilters,
    GoToPage(usize),
    NextPage,
    PrevPage,
    ToggleBookmark(String),
    Reload,
    Shutdown,
}

pub struct GuideListDriver<R> {
    orchestrator: GuideListOrchestrator<R>,
    source: Arc<dyn GuideSource>,
    fetch_timeout: Duration,
    poll: PollSchedule,
    bookmark_store: Option<BookmarkStore>,
}

impl<R: RenderTarget> GuideListDriver<R> {
    pub fn new(
        orchestrator: GuideListOrchestrator<R>,
        source: Arc<dyn GuideSource>,
        fetch_timeout: Duration,
        poll: PollSchedule,
    ) -> Self {
        Self {
            orchestrator,
            source,
            fetch_timeout,
            poll,
            bookmark_store: None,
        }
    }

    pub fn with_bookmark_store(mut self, store: BookmarkStore) -> Self {
        self.bookmark_store = Some(store);
        self
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<UiCommand>) -> GuideListOrchestrator<R> {
        let (done_tx, mut done_rx) = mpsc::channel::<(FetchTicket, FetchOutcome)>(8);

        let ticket = self.orchestrator.start();
        self.spawn_fetch(ticket, done_tx.clone());
        let mut next_poll = Instant::now() + self.poll.interval_for(0);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None | Some(UiCommand::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd, &done_tx).await,
                },
                Some((ticket, outcome)) = done_rx.recv() => {
                    self.orchestrator.complete_fetch(ticket, outcome);
                }
                _ = tokio::time::sleep_until(next_poll) => {
                    if let Some(ticket) = self.orchestrator.begin_poll() {
                        self.spawn_fetch(ticket, done_tx.clone());
                    }
                    let count = self.orchestrator.collection().full_list().len();
                    next_poll = Instant::now() + self.poll.interval_for(count);
                }
            }
        }

        info!("guide list driver stopped");
        self.orchestrator
    }

    async fn handle_command(
        &mut self,
        cmd: UiCommand,
        done_tx: &mpsc::Sender<(FetchTicket, FetchOutcome)>,
    ) {
        match cmd {
            UiCommand::Search(inputs) => {
                self.orchestrator.search_from(&inputs);
            }
            UiCommand::ResetFilters => {
                self.orchestrator.reset_filters();
            }
            UiCommand::GoToPage(page) => {
                self.orchestrator.go_to_page(page);
            }
            UiCommand::NextPage => {
                self.orchestrator.next_page();
            }
            UiCommand::PrevPage => {
                self.orchestrator.prev_page();
            }
            UiCommand::ToggleBookmark(id) => {
                self.orchestrator.toggle_bookmark(&id);
                if let Some(store) = &self.bookmark_store {
                    if let Err(err) = store.save(self.orchestrator.bookmarks()).await {
                        warn!(error = %err, "failed to persist bookmarks");
                    }
                }
            }
            UiCommand::Reload => {
                let ticket = self.orchestrator.begin_reload();
                self.spawn_fetch(ticket, done_tx.clone());
            }
            UiCommand::Shutdown => {}
        }
    }

    fn spawn_fetch(&self, ticket: FetchTicket, done_tx: mpsc::Sender<(FetchTicket, FetchOutcome)>) {
        let source = Arc::clone(&self.source);
        let timeout = self.fetch_timeout;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, source.fetch_outcome()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(generation = ticket.generation, ?timeout, "guide fetch timed out");
                    FetchOutcome::Unavailable(format!("timed out after {timeout:?}"))
                }
            };
            let _ = done_tx.send((ticket, outcome)).await;
        });
    }
}
