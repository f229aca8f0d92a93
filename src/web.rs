use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::cache::Caches;
use crate::config::*;
use crate::crs::{self, CRS_OPTIONS};
use crate::error::MapError;
use crate::fonts::FontLibrary;
use crate::pipeline::{
    GeneratedMap, MapContext, MapRequest, MapSource, Notice, generate, group_thousands,
};
use crate::render::{escape_xml, fig_to_bytes};

/// Shared handler state. `S` is where geocodes, buffers and networks come from.
pub struct AppState<S = MapContext> {
    source: Arc<S>,
    caches: Caches,
    fonts: FontLibrary,
    render_slots: Arc<Semaphore>,
    next_id: Arc<AtomicU64>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            caches: self.caches.clone(),
            fonts: self.fonts.clone(),
            render_slots: self.render_slots.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl AppState {
    pub fn new(ctx: MapContext) -> Self {
        let caches = ctx.caches.clone();
        let fonts = ctx.fonts.clone();
        Self::with_source(ctx, caches, fonts)
    }
}

impl<S: MapSource + Send + Sync + 'static> AppState<S> {
    pub fn with_source(source: S, caches: Caches, fonts: FontLibrary) -> Self {
        Self {
            source: Arc::new(source),
            caches,
            fonts,
            render_slots: Arc::new(Semaphore::new(RENDER_SLOTS)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn new_map_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        format!("{secs:x}{n:04x}")
    }

    async fn run(&self, request: &MapRequest) -> Result<(String, Arc<GeneratedMap>), MapError> {
        let mut progress = |pct: u8, status: &str| tracing::info!("[{pct:>3}%] {status}");
        let map = generate(&*self.source, &self.fonts, request, &mut progress).await?;
        let map = Arc::new(map);
        let id = self.new_map_id();
        self.caches.store_map(id.clone(), map.clone()).await;
        Ok((id, map))
    }

    async fn find_map(&self, id: &str) -> Result<Arc<GeneratedMap>, MapError> {
        self.caches
            .map(id)
            .await
            .ok_or_else(|| MapError::MapNotFound(id.to_string()))
    }

    /// PNG for a stored map, encoded at most once per DPI. Encoding waits for
    /// one of the render slots.
    async fn rasterize(
        &self,
        id: &str,
        map: Arc<GeneratedMap>,
        dpi: u32,
    ) -> Result<Bytes, MapError> {
        let render = async {
            let _slot = self
                .render_slots
                .acquire()
                .await
                .map_err(|e| MapError::Render(format!("render queue closed: {e}")))?;
            tokio::task::spawn_blocking(move || fig_to_bytes(&map.figure, dpi))
                .await
                .map_err(|e| MapError::Render(format!("rendering task failed: {e}")))?
        };
        self.caches.png(id, dpi, render).await
    }
}

pub fn create_router<S: MapSource + Send + Sync + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/generate", post(generate_form::<S>))
        .route("/maps/{id}/preview.png", get(preview_png::<S>))
        .route("/maps/{id}/download", get(download_png::<S>))
        .route("/api/crs", get(list_crs))
        .route("/api/maps", post(generate_json::<S>))
        .route("/health", get(health_check))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for MapError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn status_for(err: &MapError) -> StatusCode {
    match err {
        MapError::InvalidRequest(_) | MapError::UnsupportedCrs(_) => StatusCode::BAD_REQUEST,
        MapError::CityNotFound(_) | MapError::MapNotFound(_) => StatusCode::NOT_FOUND,
        MapError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        e if e.is_upstream() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// HTML front-end
// ============================================================================

/// Settings form as posted by the browser. Unchecked boxes are absent.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsForm {
    city: String,
    radius_km: u32,
    crs: u32,
    drive: Option<String>,
    bike: Option<String>,
    walk: Option<String>,
    dpi: u32,
}

impl From<SettingsForm> for MapRequest {
    fn from(form: SettingsForm) -> Self {
        MapRequest {
            city: form.city,
            radius_km: form.radius_km,
            crs: form.crs,
            drive: form.drive.is_some(),
            bike: form.bike.is_some(),
            walk: form.walk.is_some(),
            all: false,
            dpi: form.dpi,
        }
    }
}

async fn index() -> Html<String> {
    Html(page(&MapRequest::default(), &welcome()))
}

async fn generate_form<S: MapSource + Send + Sync + 'static>(
    State(state): State<AppState<S>>,
    Form(form): Form<SettingsForm>,
) -> (StatusCode, Html<String>) {
    let request = MapRequest::from(form);
    match state.run(&request).await {
        Ok((id, map)) => (StatusCode::OK, Html(page(&request, &result_panel(&id, &map)))),
        Err(e) => {
            tracing::error!("Map generation failed: {e}");
            (status_for(&e), Html(page(&request, &error_panel(&e))))
        }
    }
}

fn page(request: &MapRequest, main: &str) -> String {
    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>City Transport Map Generator</title>
<style>{STYLE}</style>
</head>
<body>
<aside>{sidebar}</aside>
<main>
<h1>City Transport Map Generator</h1>
<p>Generate street network maps from OpenStreetMap data</p>
{main}
</main>
</body>
</html>"##,
        sidebar = sidebar(request),
    )
}

const STYLE: &str = "body{margin:0;display:flex;font-family:sans-serif}\
aside{width:20rem;padding:1rem;background:#F0F2F6;min-height:100vh}\
main{flex:1;padding:0rem 1rem}\
label{display:block;margin:.5rem 0}\
button{width:100%;background-color:#FF4B4B;color:white;font-weight:bold;border-radius:5px;padding:.5rem 1rem;border:none}\
button:hover{background-color:#FF6B6B}\
.success-box{padding:1rem;border-radius:.5rem;background-color:#D4EDDA;border:1px solid #C3E6CB;color:#155724;margin:1rem 0}\
.info-box{padding:1rem;border-radius:.5rem;background-color:#D1ECF1;border:1px solid #BEE5EB;color:#0C5460;margin:1rem 0}\
.warning-box{padding:1rem;border-radius:.5rem;background-color:#FFF3CD;border:1px solid #FFEEBA;color:#856404;margin:1rem 0}\
.error-box{padding:1rem;border-radius:.5rem;background-color:#F8D7DA;border:1px solid #F5C6CB;color:#721C24;margin:1rem 0}\
img{max-width:100%}";

fn sidebar(request: &MapRequest) -> String {
    let mut crs_options = String::new();
    for (epsg, label) in CRS_OPTIONS {
        let selected = if epsg == request.crs { " selected" } else { "" };
        let _ = write!(crs_options, r#"<option value="{epsg}"{selected}>{label}</option>"#);
    }
    let mut dpi_options = String::new();
    for dpi in DPI_OPTIONS {
        let selected = if dpi == request.dpi { " selected" } else { "" };
        let _ = write!(dpi_options, r#"<option value="{dpi}"{selected}>{dpi}</option>"#);
    }
    let checked = |on: bool| if on { " checked" } else { "" };

    format!(
        r##"<h2>⚙️ Map Settings</h2>
<form method="post" action="/generate">
<label>City Name
<input name="city" value="{city}" title="Include state/country for better results (e.g., 'Paris, France')"></label>
<label>Map Radius (km): <output id="r">{radius}</output>
<input type="range" name="radius_km" min="{MIN_RADIUS_KM}" max="{MAX_RADIUS_KM}" step="1" value="{radius}" oninput="r.value=this.value"></label>
<label>Coordinate System
<select name="crs">{crs_options}</select></label>
<hr><h3>Network Types</h3>
<label><input type="checkbox" name="drive"{drive}> 🚗 Driving Roads</label>
<label><input type="checkbox" name="bike"{bike}> 🚴 Bike Paths</label>
<label><input type="checkbox" name="walk"{walk}> 🚶 Walking Paths</label>
<hr>
<label>Image Quality (DPI)
<select name="dpi">{dpi_options}</select></label>
<hr>
<button type="submit">🚀 Generate Map</button>
</form>
<details><summary>ℹ️ Tips &amp; Info</summary>{TIPS}</details>"##,
        city = escape_xml(&request.city),
        radius = request.radius_km,
        drive = checked(request.drive),
        bike = checked(request.bike),
        walk = checked(request.walk),
    )
}

const TIPS: &str = "<p><b>Tips for best results:</b></p>\
<ul><li>Include country/state in city name</li>\
<li>Start with smaller radius for faster results</li>\
<li>Large cities may take 1-2 minutes</li></ul>\
<p><b>Network Types:</b></p>\
<ul><li><b>Drive</b>: All drivable roads</li>\
<li><b>Bike</b>: Dedicated bike paths and lanes</li>\
<li><b>Walk</b>: Pedestrian paths and trails</li></ul>\
<p><b>Common CRS by Region:</b></p>\
<ul><li><b>Global/Unknown</b>: WGS 84</li>\
<li><b>Web maps</b>: Web Mercator</li>\
<li><b>Texas</b>: State Plane 2277</li>\
<li><b>West US</b>: UTM Zone 10N</li>\
<li><b>Europe</b>: UTM Zone 33N</li>\
<li><b>India West/Central</b>: UTM Zone 43N</li>\
<li><b>India East/Bangladesh</b>: UTM Zone 44N-45N</li></ul>";

fn welcome() -> String {
    r#"<div class="info-box">Configure your map settings in the sidebar and click 'Generate Map' to begin</div>"#
        .to_string()
}

fn notice_box(notice: &Notice) -> String {
    let (class, icon, text) = match notice {
        Notice::Success(t) => ("success-box", "✅", t),
        Notice::Warning(t) => ("warning-box", "⚠️", t),
        Notice::Info(t) => ("info-box", "📊", t),
    };
    format!(r#"<div class="{class}">{icon} {}</div>"#, escape_xml(text))
}

fn result_panel(id: &str, map: &GeneratedMap) -> String {
    let mut html = String::new();
    for notice in &map.notices {
        html.push_str(&notice_box(notice));
    }
    let _ = write!(
        html,
        r#"<p><b>Networks included:</b> {networks}</p>
<img src="/maps/{id}/preview.png" alt="Map of {city}">
<p><a href="/maps/{id}/download?dpi={dpi}" download="{file}"><button type="button">📥 Download Map (PNG, {dpi} DPI)</button></a></p>"#,
        networks = escape_xml(&map.networks.join(", ")),
        city = escape_xml(&map.city),
        dpi = map.dpi,
        file = escape_xml(&map.file_name),
    );
    html
}

fn error_panel(err: &MapError) -> String {
    let mut html = format!(
        r#"<div class="error-box">❌ {}</div>"#,
        escape_xml(&err.to_string())
    );
    if err.is_upstream() || matches!(err, MapError::Render(_)) {
        html.push_str(
            r#"<div class="info-box">💡 Try reducing the map radius or choosing a different city</div>"#,
        );
    }
    html
}

// ============================================================================
// Images
// ============================================================================

#[derive(Deserialize)]
struct DownloadParams {
    dpi: Option<u32>,
}

async fn preview_png<S: MapSource + Send + Sync + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Response, MapError> {
    let map = state.find_map(&id).await?;
    let png = state.rasterize(&id, map, PREVIEW_DPI).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

async fn download_png<S: MapSource + Send + Sync + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, MapError> {
    let map = state.find_map(&id).await?;
    let dpi = params.dpi.unwrap_or(map.dpi);
    if !DPI_OPTIONS.contains(&dpi) {
        return Err(MapError::InvalidRequest(format!(
            "Image quality must be one of {DPI_OPTIONS:?} DPI"
        )));
    }
    let disposition = attachment(&map.file_name);
    let png = state.rasterize(&id, map, dpi).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        png,
    )
        .into_response())
}

/// Content-Disposition value: an ASCII-only `filename` for old clients and the
/// exact name as RFC 5987 `filename*`.
fn attachment(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

// ============================================================================
// JSON API
// ============================================================================

async fn list_crs() -> Json<Vec<crs::CrsOption>> {
    Json(crs::options())
}

#[derive(Serialize)]
struct MapReport {
    id: String,
    city: String,
    address: String,
    networks: Vec<String>,
    notices: Vec<Notice>,
    nodes: usize,
    edges: usize,
    total_length_km: f64,
    length_by_highway_km: BTreeMap<String, f64>,
    preview_url: String,
    download_url: String,
    file_name: String,
}

async fn generate_json<S: MapSource + Send + Sync + 'static>(
    State(state): State<AppState<S>>,
    Json(request): Json<MapRequest>,
) -> Result<Json<MapReport>, MapError> {
    let (id, map) = state.run(&request).await?;
    tracing::debug!(
        "Map {id}: {} nodes, {} edges",
        group_thousands(map.node_count),
        group_thousands(map.edge_count)
    );
    Ok(Json(MapReport {
        preview_url: format!("/maps/{id}/preview.png"),
        download_url: format!("/maps/{id}/download?dpi={}", map.dpi),
        city: map.city.clone(),
        address: map.address.clone(),
        networks: map.networks.clone(),
        notices: map.notices.clone(),
        nodes: map.node_count,
        edges: map.edge_count,
        total_length_km: round2(map.total_length_km),
        length_by_highway_km: map
            .length_by_highway_km
            .iter()
            .map(|(class, km)| (class.clone(), round2(*km)))
            .collect(),
        file_name: map.file_name.clone(),
        id,
    }))
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::FakeSource;
    use axum::body::{Body, to_bytes};
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(MapContext {
            client: reqwest::Client::new(),
            caches: Caches::new(std::env::temp_dir().join("citymap-web-test")),
            fonts: FontLibrary::default(),
        })
    }

    fn fake_state() -> AppState<FakeSource> {
        AppState::with_source(
            FakeSource { failing: vec![] },
            Caches::new(std::env::temp_dir().join("citymap-web-test")),
            FontLibrary::default(),
        )
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, content_type: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let response = create_router(test_state()).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("healthy"));
    }

    #[tokio::test]
    async fn lists_coordinate_systems() {
        let response = create_router(test_state()).oneshot(get("/api/crs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let options: Vec<serde_json::Value> =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(options.len(), CRS_OPTIONS.len());
        assert_eq!(options[0]["epsg"], 4326);
    }

    #[tokio::test]
    async fn index_shows_default_settings() {
        let response = create_router(test_state()).oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response).await;
        assert!(html.contains(r#"value="College Station, Texas""#));
        assert!(html.contains(r#"<option value="2277" selected>"#));
        assert!(html.contains(r#"name="drive" checked"#));
        assert!(html.contains(r#"name="walk">"#));
        assert!(html.contains("click 'Generate Map' to begin"));
    }

    #[tokio::test]
    async fn form_without_networks_is_rejected() {
        let request = post(
            "/generate",
            "application/x-www-form-urlencoded",
            "city=Paris&radius_km=15&crs=2277&dpi=150",
        );
        let response = create_router(test_state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let html = body_text(response).await;
        assert!(html.contains("Select at least one network type"));
        assert!(html.contains(r#"value="Paris""#));
    }

    #[tokio::test]
    async fn form_generates_result_page() {
        let request = post(
            "/generate",
            "application/x-www-form-urlencoded",
            "city=College+Station%2C+Texas&radius_km=15&crs=2277&drive=on&bike=on&dpi=150",
        );
        let response = create_router(fake_state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response).await;
        assert!(html.contains("Found: College Station, Brazos County"));
        assert!(html.contains("<b>Networks included:</b> Drive, Bike"));
        assert!(html.contains("/preview.png"));
        assert!(html.contains("Download Map (PNG, 150 DPI)"));
        assert!(!html.contains("error-box"));
    }

    #[tokio::test]
    async fn json_request_with_unknown_crs_is_rejected() {
        let request = post(
            "/api/maps",
            "application/json",
            r#"{"city": "Paris, France", "crs": 1234}"#,
        );
        let response = create_router(test_state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("EPSG:1234"));
    }

    #[tokio::test]
    async fn json_request_reports_map_and_serves_preview() {
        let app = create_router(fake_state());
        let request = post(
            "/api/maps",
            "application/json",
            r#"{"city": "College Station, Texas", "dpi": 72}"#,
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert!(!report["id"].as_str().unwrap().is_empty());
        assert_eq!(report["networks"], serde_json::json!(["Drive", "Bike"]));
        assert_eq!(report["nodes"], 3);
        assert_eq!(report["edges"], 4);
        assert_eq!(report["file_name"], "College_Station_Texas_transport_map.png");

        let preview = report["preview_url"].as_str().unwrap();
        let response = app.oneshot(get(preview)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn unknown_map_is_not_found() {
        let response = create_router(test_state())
            .oneshot(get("/maps/missing/download?dpi=72"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stored_map_downloads_as_png_once_per_dpi() {
        let state = fake_state();
        let map = FakeSource { failing: vec![] }.run(&MapRequest::default()).await.unwrap();
        state.caches.store_map("abc".into(), Arc::new(map)).await;
        let app = create_router(state.clone());

        let response = app.clone().oneshot(get("/maps/abc/download?dpi=72")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"College_Station_Texas_transport_map.png\"; \
             filename*=UTF-8''College_Station_Texas_transport_map.png"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"\x89PNG"));

        // A second fetch is served from the PNG store without rendering.
        let cached = state
            .caches
            .png("abc", 72, async { Err::<Vec<u8>, _>(MapError::Render("rendered again".into())) })
            .await
            .unwrap();
        assert_eq!(cached, bytes);

        let response = app.oneshot(get("/maps/abc/download?dpi=100")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn attachment_name_is_header_safe() {
        let value = attachment("Zürich \"Old\"\u{7}.png");
        assert_eq!(
            value,
            "attachment; filename=\"Z_rich__Old__.png\"; \
             filename*=UTF-8''Z%C3%BCrich%20%22Old%22%07.png"
        );
        assert!(HeaderValue::from_str(&value).is_ok());
    }

    #[test]
    fn error_panel_adds_hint_for_upstream_failures() {
        assert!(error_panel(&MapError::NoNetworks).contains("Try reducing the map radius"));
        assert!(!error_panel(&MapError::CityNotFound("x".into())).contains("Try reducing"));
    }
}
