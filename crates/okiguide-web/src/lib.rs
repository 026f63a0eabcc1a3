//! Axum + Askama guide directory: the `{ success, guides }` API and the htmx list pages.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use okiguide_core::{
    normalize_location, ExtensionPolicy, FilterInputReader, FilterInputs, FilterSpec, Guide,
    GuideSnapshot, PriceBand, PAGE_SIZE,
};
use okiguide_storage::{GuideEnvelope, GuideSource, JsonFileGuideSource};
use okiguide_sync::paginate;
use serde::Deserialize;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "okiguide-web";

const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub data_path: PathBuf,
    pub db: Option<PgPool>,
}

impl AppState {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            db: None,
        }
    }

    pub fn with_db(mut self, pool: PgPool) -> Self {
        self.db = Some(pool);
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct GuidesQuery {
    location: Option<String>,
    language: Option<String>,
    price: Option<String>,
    keyword: Option<String>,
    page: Option<String>,
}

impl GuidesQuery {
    fn page(&self) -> usize {
        self.page
            .as_deref()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(1)
    }
}

impl FilterInputReader for GuidesQuery {
    fn read_filter_inputs(&self) -> FilterInputs {
        FilterInputs {
            location: self.location.clone(),
            language: self.language.clone(),
            price: self.price.clone(),
            keyword: self.keyword.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct RegionCountRow {
    code: String,
    count: usize,
    linkable: bool,
}

#[derive(Debug, Clone)]
struct SelectOption {
    value: String,
    label: String,
    selected: bool,
}

#[derive(Debug, Clone)]
struct GuideCard {
    id: String,
    name: String,
    location: String,
    languages_text: String,
    session_rate: u32,
    extension_text: String,
    late_night: bool,
    introduction: String,
}

impl From<&Guide> for GuideCard {
    fn from(guide: &Guide) -> Self {
        Self {
            id: guide.id.clone(),
            name: guide.name.clone(),
            location: guide.location.clone(),
            languages_text: if guide.languages.is_empty() {
                "-".to_string()
            } else {
                guide.languages.join(", ")
            },
            session_rate: guide.session_rate,
            extension_text: match guide.extension_policy {
                ExtensionPolicy::Ok => "ok",
                ExtensionPolicy::Ask => "ask",
                ExtensionPolicy::No => "no",
            }
            .to_string(),
            late_night: guide.late_night_policy,
            introduction: guide.introduction.clone(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_guides: usize,
    regions: Vec<RegionCountRow>,
}

#[derive(Template)]
#[template(path = "guides.html")]
struct GuidesPageTemplate {
    location: String,
    keyword: String,
    language_options: Vec<SelectOption>,
    price_options: Vec<SelectOption>,
    page: usize,
    filter_query: String,
}

#[derive(Template)]
#[template(path = "guides_table_partial.html")]
struct GuidesTablePartialTemplate {
    cards: Vec<GuideCard>,
    no_results: bool,
    range_label: String,
    page: usize,
    total_pages: usize,
    has_prev: bool,
    has_next: bool,
    prev_page: usize,
    next_page: usize,
    filter_query: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/guides", get(guides_page_handler))
        .route("/guides/table", get(guides_table_handler))
        .route("/api/guides", get(api_guides_handler))
        .route("/api/guides/{id}", get(api_guide_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("OKIGUIDE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let data_path = std::env::var("OKIGUIDE_DATA_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/guides.json"));
    let mut state = AppState::new(data_path);
    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        if let Some(pool) = connect_db(&database_url).await {
            state = state.with_db(pool);
        }
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "guide directory listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_guides(&state).await {
        Ok(snapshot) => {
            let mut counts = BTreeMap::<String, usize>::new();
            for guide in snapshot.guides() {
                let code = normalize_location(&guide.location).unwrap_or(OTHER_REGION);
                *counts.entry(code.to_string()).or_default() += 1;
            }
            render_html(IndexTemplate {
                total_guides: snapshot.len(),
                regions: counts
                    .into_iter()
                    .map(|(code, count)| RegionCountRow {
                        linkable: code != OTHER_REGION,
                        code,
                        count,
                    })
                    .collect(),
            })
        }
        Err(err) => server_error(err),
    }
}

const OTHER_REGION: &str = "other";

/// `&key=value` pairs for the submitted filter, so pager links replay it unchanged.
fn filter_query(spec: &FilterSpec) -> String {
    let fields = [
        ("location", spec.location.as_deref()),
        ("language", spec.language.as_deref()),
        ("price", spec.price.map(PriceBand::as_str)),
        ("keyword", spec.keyword.as_deref()),
    ];
    fields
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| format!("&{key}={}", urlencoding::encode(v))))
        .collect()
}

async fn guides_page_handler(Query(query): Query<GuidesQuery>) -> Response {
    let spec = FilterSpec::from_inputs(&query.read_filter_inputs());
    let selected_language = spec.language.clone().unwrap_or_default().to_lowercase();
    let language_options = [
        ("english", "English / 英語"),
        ("japanese", "Japanese / 日本語"),
        ("chinese", "Chinese / 中国語"),
        ("korean", "Korean / 韓国語"),
    ]
    .into_iter()
    .map(|(value, label)| SelectOption {
        value: value.to_string(),
        label: label.to_string(),
        selected: value == selected_language,
    })
    .collect();
    let price_options = [
        (PriceBand::Budget, "¥6,000 - ¥10,000"),
        (PriceBand::Premium, "¥10,001 - ¥20,000"),
        (PriceBand::Luxury, "¥20,001 -"),
    ]
    .into_iter()
    .map(|(band, label)| SelectOption {
        value: band.as_str().to_string(),
        label: label.to_string(),
        selected: spec.price == Some(band),
    })
    .collect();

    render_html(GuidesPageTemplate {
        location: spec.location.clone().unwrap_or_default(),
        keyword: spec.keyword.clone().unwrap_or_default(),
        language_options,
        price_options,
        page: query.page().max(1),
        filter_query: filter_query(&spec),
    })
}

async fn guides_table_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GuidesQuery>,
) -> Response {
    match load_guides(&state).await {
        Ok(snapshot) => {
            let spec = FilterSpec::from_inputs(&query.read_filter_inputs());
            let filtered;
            let source = if spec.is_empty() {
                snapshot.guides()
            } else {
                filtered = okiguide_core::filter_guides(snapshot.guides(), &spec);
                filtered.as_slice()
            };
            let view = paginate(source, query.page(), PAGE_SIZE);
            let mut resp = render_html(GuidesTablePartialTemplate {
                cards: view.items.iter().map(GuideCard::from).collect(),
                no_results: view.is_no_results(),
                range_label: view.range.label(),
                page: view.page,
                total_pages: view.total_pages,
                has_prev: view.has_prev(),
                has_next: view.has_next(),
                prev_page: view.page.saturating_sub(1).max(1),
                next_page: (view.page + 1).min(view.total_pages),
                filter_query: filter_query(&spec),
            });
            resp.headers_mut().insert(
                header::HeaderName::from_static("hx-trigger"),
                header::HeaderValue::from_static("guideTableLoaded"),
            );
            resp
        }
        Err(err) => server_error(err),
    }
}

async fn api_guides_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_guides(&state).await {
        Ok(snapshot) => Json(envelope(true, snapshot.guides())).into_response(),
        Err(err) => {
            warn!(error = %err, "guide api could not load guides");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope(false, &[]))).into_response()
        }
    }
}

async fn api_guide_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match load_guides(&state).await {
        Ok(snapshot) => match snapshot.guides().iter().find(|g| g.id == id) {
            Some(guide) => Json(serde_json::json!({ "success": true, "guide": guide })).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "success": false, "error": "guide not found" })),
            )
                .into_response(),
        },
        Err(err) => {
            warn!(error = %err, "guide api could not load guides");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope(false, &[]))).into_response()
        }
    }
}

fn envelope(success: bool, guides: &[Guide]) -> GuideEnvelope {
    GuideEnvelope {
        success,
        guides: guides
            .iter()
            .filter_map(|g| serde_json::to_value(g).ok())
            .collect(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

/// PostgreSQL when a pool is configured and the table is non-empty, otherwise the JSON data file.
async fn load_guides(state: &AppState) -> anyhow::Result<GuideSnapshot> {
    if let Some(pool) = &state.db {
        match load_guides_from_db(pool).await {
            Ok(snapshot) if !snapshot.is_empty() => return Ok(snapshot),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "guide query failed; falling back to data file"),
        }
    }
    let source = JsonFileGuideSource::new(&state.data_path);
    Ok(source.fetch_guides().await?)
}

async fn connect_db(database_url: &str) -> Option<PgPool> {
    match PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(DB_ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
    {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(error = %err, "database unreachable; serving guides from data file");
            None
        }
    }
}

async fn load_guides_from_db(pool: &PgPool) -> anyhow::Result<GuideSnapshot> {
    let rows = sqlx::query(
        r#"
        SELECT id::text AS id,
               data_json
          FROM guides
         ORDER BY created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        let mut data: serde_json::Value = row.try_get("data_json")?;
        if let Some(obj) = data.as_object_mut() {
            obj.entry("id").or_insert_with(|| serde_json::Value::String(id));
        }
        records.push(data);
    }
    Ok(GuideSnapshot::from_json_records(&records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn data_dir(guides: usize) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut records = (0..guides)
            .map(|i| {
                serde_json::json!({
                    "id": format!("g{i:02}"),
                    "name": format!("Guide {i}"),
                    "location": if i % 3 == 0 { "Ishigaki" } else { "Naha" },
                    "languages": ["日本語", "English"],
                    "sessionRate": 8000 + i * 1000,
                    "status": "approved",
                    "registeredAt": format!("2026-01-{:02}T00:00:00Z", i + 1)
                })
            })
            .collect::<Vec<_>>();
        records.push(serde_json::json!({
            "id": "pending", "name": "Pending", "sessionRate": 9000, "status": "pending"
        }));
        let body = serde_json::json!({ "success": true, "guides": records });
        std::fs::write(dir.path().join("guides.json"), body.to_string()).unwrap();
        dir
    }

    fn test_app(dir: &TempDir) -> Router {
        app(AppState::new(dir.path().join("guides.json")))
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn api_returns_envelope_of_displayable_guides_newest_first() {
        let dir = data_dir(20);
        let (status, body) = get_text(test_app(&dir), "/api/guides").await;
        assert_eq!(status, StatusCode::OK);
        let envelope: GuideEnvelope = serde_json::from_str(&body).unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.guides.len(), 20);
        assert_eq!(envelope.guides[0]["id"], "g19");
        assert!(envelope.guides.iter().all(|g| g["id"] != "pending"));
    }

    #[tokio::test]
    async fn api_reports_failure_when_data_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_text(test_app(&dir), "/api/guides").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let envelope: GuideEnvelope = serde_json::from_str(&body).unwrap();
        assert!(!envelope.success);
    }

    #[tokio::test]
    async fn api_detail_finds_guide_or_404s() {
        let dir = data_dir(3);
        let (status, body) = get_text(test_app(&dir), "/api/guides/g01").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"Guide 1\""));

        let (status, _) = get_text(test_app(&dir), "/api/guides/pending").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn table_partial_paginates_and_clamps() {
        let dir = data_dir(30);
        let (status, body) = get_text(test_app(&dir), "/guides/table?page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("13-24 of 30"));

        let (_, body) = get_text(test_app(&dir), "/guides/table?page=99").await;
        assert!(body.contains("25-30 of 30"));
    }

    #[tokio::test]
    async fn table_partial_filters_and_shows_no_results() {
        let dir = data_dir(30);
        let (_, body) = get_text(test_app(&dir), "/guides/table?location=ishigaki&page=").await;
        assert!(body.contains("1-10 of 10"));

        let (_, body) = get_text(test_app(&dir), "/guides/table?price=luxury").await;
        assert!(body.contains("1-12 of 17"));

        let (_, body) = get_text(test_app(&dir), "/guides/table?keyword=nowhere").await;
        assert!(body.contains("No guides found"));
    }

    #[tokio::test]
    async fn index_and_page_render() {
        let dir = data_dir(6);
        let (status, body) = get_text(test_app(&dir), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Okinawa Guide Directory"));
        assert!(body.contains("yaeyama"));

        let (status, body) = get_text(test_app(&dir), "/guides?language=english&price=budget").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("guide-filter"));
        assert!(body.contains("page=1&amp;language=english&amp;price=budget"));
    }

    fn write_guides(dir: &TempDir, records: Vec<serde_json::Value>) {
        let body = serde_json::json!({ "success": true, "guides": records });
        std::fs::write(dir.path().join("guides.json"), body.to_string()).unwrap();
    }

    #[tokio::test]
    async fn pager_links_replay_the_submitted_filter() {
        let dir = tempfile::tempdir().unwrap();
        write_guides(
            &dir,
            (0..20)
                .map(|i| {
                    serde_json::json!({
                        "id": format!("y{i:02}"),
                        "name": format!("Yaeyama {i}"),
                        "location": "Ishigaki",
                        "sessionRate": 9000,
                        "status": "approved",
                        "registeredAt": format!("2026-02-{:02}T00:00:00Z", i + 1)
                    })
                })
                .collect(),
        );

        let (status, body) =
            get_text(test_app(&dir), "/guides/table?page=2&location=ishigaki").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("13-20 of 20"));
        assert!(body.contains("/guides/table?page=1&amp;location=ishigaki"));
        assert!(!body.contains("hx-include"));
    }

    #[tokio::test]
    async fn unrecognised_regions_are_counted_but_not_linked() {
        let dir = tempfile::tempdir().unwrap();
        write_guides(
            &dir,
            vec![
                serde_json::json!({
                    "id": "k1", "name": "Kume", "location": "Kumejima",
                    "sessionRate": 9000, "status": "approved"
                }),
                serde_json::json!({
                    "id": "i1", "name": "Ishi", "location": "Ishigaki",
                    "sessionRate": 9000, "status": "approved"
                }),
            ],
        );

        let (_, body) = get_text(test_app(&dir), "/").await;
        assert!(body.contains("href=\"/guides?location=yaeyama\""));
        assert!(body.contains("other (1)"));
        assert!(!body.contains("location=other"));
    }

    #[tokio::test]
    async fn unreachable_database_falls_back_without_stalling() {
        let pool = tokio::time::timeout(
            Duration::from_secs(10),
            connect_db("postgres://okiguide@127.0.0.1:1/okiguide"),
        )
        .await
        .unwrap();
        assert!(pool.is_none());

        let dir = data_dir(2);
        let (status, _) = get_text(test_app(&dir), "/api/guides").await;
        assert_eq!(status, StatusCode::OK);
    }
}
