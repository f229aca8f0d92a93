use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::buffer::StudyArea;
use crate::cache::Caches;
use crate::config::*;
use crate::crs::Crs;
use crate::error::MapError;
use crate::fonts::FontLibrary;
use crate::geocode::Location;
use crate::network::StreetNetwork;
use crate::osm::NetworkType;
use crate::render::{MapFigure, generate_map_image, map_file_name};

/// User-chosen map settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MapRequest {
    pub city: String,
    pub radius_km: u32,
    pub crs: u32,
    pub drive: bool,
    pub bike: bool,
    pub walk: bool,
    /// Unfiltered network with every public way; not offered by the form.
    pub all: bool,
    pub dpi: u32,
}

impl Default for MapRequest {
    fn default() -> Self {
        Self {
            city: DEFAULT_CITY.to_string(),
            radius_km: DEFAULT_RADIUS_KM,
            crs: DEFAULT_EPSG,
            drive: true,
            bike: true,
            walk: false,
            all: false,
            dpi: DEFAULT_DPI,
        }
    }
}

impl MapRequest {
    pub fn validate(&self) -> Result<Crs, MapError> {
        if self.city.trim().is_empty() {
            return Err(MapError::InvalidRequest("Enter a city name".into()));
        }
        if !(MIN_RADIUS_KM..=MAX_RADIUS_KM).contains(&self.radius_km) {
            return Err(MapError::InvalidRequest(format!(
                "Map radius must be between {MIN_RADIUS_KM} and {MAX_RADIUS_KM} km"
            )));
        }
        if !DPI_OPTIONS.contains(&self.dpi) {
            return Err(MapError::InvalidRequest(format!(
                "Image quality must be one of {DPI_OPTIONS:?} DPI"
            )));
        }
        if self.network_types().is_empty() {
            return Err(MapError::InvalidRequest(
                "Select at least one network type".into(),
            ));
        }
        Crs::from_epsg(self.crs)
    }

    /// Selected networks, always in drive, bike, walk, all order.
    pub fn network_types(&self) -> Vec<NetworkType> {
        [
            (self.drive, NetworkType::Drive),
            (self.bike, NetworkType::Bike),
            (self.walk, NetworkType::Walk),
            (self.all, NetworkType::All),
        ]
        .into_iter()
        .filter_map(|(on, nt)| on.then_some(nt))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum Notice {
    Success(String),
    Warning(String),
    Info(String),
}

/// Everything the front-end shows after a successful run.
#[derive(Debug, Clone)]
pub struct GeneratedMap {
    pub figure: MapFigure,
    pub city: String,
    pub address: String,
    pub networks: Vec<String>,
    pub notices: Vec<Notice>,
    pub file_name: String,
    pub dpi: u32,
    pub node_count: usize,
    pub edge_count: usize,
    pub total_length_km: f64,
    pub length_by_highway_km: BTreeMap<String, f64>,
}

/// The three expensive lookups the pipeline depends on.
pub trait MapSource {
    fn geocode(&self, city: &str) -> impl Future<Output = Result<Location, MapError>> + Send;

    fn buffer(
        &self,
        latitude: f64,
        longitude: f64,
        buffer_meters: f64,
        crs: Crs,
    ) -> impl Future<Output = Result<Arc<StudyArea>, MapError>> + Send;

    fn network(
        &self,
        area: &StudyArea,
        network_type: NetworkType,
    ) -> impl Future<Output = Result<Arc<StreetNetwork>, MapError>> + Send;
}

/// Live source: HTTP client plus TTL caches.
#[derive(Clone)]
pub struct MapContext {
    pub client: reqwest::Client,
    pub caches: Caches,
    pub fonts: FontLibrary,
}

impl MapSource for MapContext {
    async fn geocode(&self, city: &str) -> Result<Location, MapError> {
        self.caches.geocode(&self.client, city).await
    }

    async fn buffer(
        &self,
        latitude: f64,
        longitude: f64,
        buffer_meters: f64,
        crs: Crs,
    ) -> Result<Arc<StudyArea>, MapError> {
        self.caches
            .buffer(latitude, longitude, buffer_meters, crs)
            .await
    }

    async fn network(
        &self,
        area: &StudyArea,
        network_type: NetworkType,
    ) -> Result<Arc<StreetNetwork>, MapError> {
        self.caches.network(&self.client, area, network_type).await
    }
}

/// Run geocode → buffer → download → combine → layout, reporting progress as
/// `(percent, status)`.
pub async fn generate<S: MapSource>(
    source: &S,
    fonts: &FontLibrary,
    request: &MapRequest,
    progress: &mut (dyn FnMut(u8, &str) + Send),
) -> Result<GeneratedMap, MapError> {
    let crs = request.validate()?;
    let city = request.city.trim();
    let mut notices = Vec::new();

    progress(10, "Finding city location...");
    let location = source.geocode(city).await?;
    notices.push(Notice::Success(format!("Found: {}", location.address)));

    progress(20, "Creating study area...");
    let area = source
        .buffer(
            location.latitude,
            location.longitude,
            request.radius_km as f64 * 1000.0,
            crs,
        )
        .await?;
    progress(30, "Study area ready");

    let selected = request.network_types();
    let total = selected.len();
    let mut graphs = Vec::new();
    let mut downloaded = Vec::new();
    // Downloads share the 30..80 band whatever the number of networks.
    let band = |done: usize| 30 + (50 * done / total) as u8;
    for (i, network_type) in selected.into_iter().enumerate() {
        let current = i + 1;
        progress(
            band(i),
            &format!(
                "Downloading {} network ({current}/{total})...",
                network_type.verb()
            ),
        );
        match source.network(&area, network_type).await {
            Ok(graph) => {
                graphs.push(graph);
                downloaded.push(network_type.label().to_string());
                notices.push(Notice::Success(format!(
                    "{} network downloaded",
                    network_type.label()
                )));
            }
            Err(e) => {
                tracing::warn!("{e}");
                notices.push(Notice::Warning(e.to_string()));
            }
        }
        progress(band(current), "Downloaded");
    }

    let Some((first, rest)) = graphs.split_first() else {
        return Err(MapError::NoNetworks);
    };

    progress(80, "Combining networks...");
    let mut combined = StreetNetwork::clone(first);
    for graph in rest {
        combined.compose(StreetNetwork::clone(graph));
    }
    notices.push(Notice::Info(format!(
        "Network contains {} nodes and {} edges",
        group_thousands(combined.node_count()),
        group_thousands(combined.edge_count()),
    )));

    progress(90, "Creating visualization...");
    let network_label = downloaded.join(" and ");
    let figure = generate_map_image(&combined, city, &network_label, fonts)?;

    progress(100, "Map generated successfully!");
    notices.push(Notice::Success(format!(
        "Map of {city} generated successfully!"
    )));

    Ok(GeneratedMap {
        figure,
        city: city.to_string(),
        address: location.address,
        networks: downloaded,
        notices,
        file_name: map_file_name(city),
        dpi: request.dpi,
        node_count: combined.node_count(),
        edge_count: combined.edge_count(),
        total_length_km: combined.total_length_m() / 1000.0,
        length_by_highway_km: combined
            .length_by_highway()
            .into_iter()
            .map(|(class, m)| (class, m / 1000.0))
            .collect(),
    })
}

pub fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::create_city_buffer;
    use crate::network::Way;
    use geo_types::Coord;
    use std::collections::HashMap;

    /// Offline source: fixed location, real buffer, canned networks.
    pub(crate) struct FakeSource {
        pub failing: Vec<NetworkType>,
    }

    impl FakeSource {
        /// Generate without fonts or progress reporting.
        pub(crate) async fn run(&self, request: &MapRequest) -> Result<GeneratedMap, MapError> {
            generate(self, &FontLibrary::default(), request, &mut |_, _: &str| {}).await
        }
    }

    fn street(id: i64, from: (i64, f64, f64), to: (i64, f64, f64)) -> Way {
        Way {
            id,
            nodes: vec![from.0, to.0],
            geometry: vec![Coord { x: from.1, y: from.2 }, Coord { x: to.1, y: to.2 }],
            tags: HashMap::new(),
        }
    }

    impl MapSource for FakeSource {
        async fn geocode(&self, city: &str) -> Result<Location, MapError> {
            if city.eq_ignore_ascii_case("atlantis") {
                return Err(MapError::CityNotFound(city.to_string()));
            }
            Ok(Location {
                address: "College Station, Brazos County, Texas, United States".into(),
                latitude: 30.6279,
                longitude: -96.3344,
            })
        }

        async fn buffer(
            &self,
            latitude: f64,
            longitude: f64,
            buffer_meters: f64,
            crs: Crs,
        ) -> Result<Arc<StudyArea>, MapError> {
            create_city_buffer(latitude, longitude, buffer_meters, crs).map(Arc::new)
        }

        async fn network(
            &self,
            area: &StudyArea,
            network_type: NetworkType,
        ) -> Result<Arc<StreetNetwork>, MapError> {
            if self.failing.contains(&network_type) {
                return Err(MapError::Download {
                    network: network_type.name().into(),
                    reason: "HTTP 504".into(),
                });
            }
            let ways = match network_type {
                NetworkType::Drive => vec![street(1, (1, -96.335, 30.627), (2, -96.334, 30.628))],
                _ => vec![
                    street(1, (1, -96.335, 30.627), (2, -96.334, 30.628)),
                    street(2, (2, -96.334, 30.628), (3, -96.333, 30.629)),
                ],
            };
            Ok(Arc::new(StreetNetwork::from_ways(
                &ways,
                Some(&area.polygon),
                false,
            )))
        }
    }

    #[test]
    fn validation_rules() {
        let ok = MapRequest::default();
        assert_eq!(ok.validate().unwrap(), Crs::TexasNorthCentral);

        let cases = [
            MapRequest { city: "  ".into(), ..MapRequest::default() },
            MapRequest { radius_km: 4, ..MapRequest::default() },
            MapRequest { radius_km: 51, ..MapRequest::default() },
            MapRequest { dpi: 100, ..MapRequest::default() },
            MapRequest { drive: false, bike: false, ..MapRequest::default() },
        ];
        for req in cases {
            assert!(matches!(req.validate(), Err(MapError::InvalidRequest(_))), "{req:?}");
        }
        let bad_crs = MapRequest { crs: 9999, ..MapRequest::default() };
        assert!(matches!(bad_crs.validate(), Err(MapError::UnsupportedCrs(9999))));
    }

    #[test]
    fn network_order_is_fixed() {
        let req = MapRequest { walk: true, ..MapRequest::default() };
        assert_eq!(
            req.network_types(),
            vec![NetworkType::Drive, NetworkType::Bike, NetworkType::Walk]
        );
        let req = MapRequest { drive: false, bike: false, all: true, ..MapRequest::default() };
        assert_eq!(req.network_types(), vec![NetworkType::All]);
    }

    #[test]
    fn thousands_separator() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }

    #[tokio::test]
    async fn generates_combined_map_with_progress() {
        let source = FakeSource { failing: vec![] };
        let mut steps = Vec::new();
        let fonts = FontLibrary::default();
        let map = generate(&source, &fonts, &MapRequest::default(), &mut |pct, status: &str| {
            steps.push((pct, status.to_string()))
        })
        .await
        .unwrap();

        assert_eq!(map.networks, vec!["Drive", "Bike"]);
        assert_eq!(map.node_count, 3);
        assert_eq!(map.edge_count, 4);
        assert_eq!(map.file_name, "College_Station_Texas_transport_map.png");
        assert!(map.figure.svg().contains(">Drive and Bike</text>"));
        assert!(map.notices.contains(&Notice::Info(
            "Network contains 3 nodes and 4 edges".into()
        )));

        let pcts: Vec<u8> = steps.iter().map(|(p, _)| *p).collect();
        assert_eq!(pcts, vec![10, 20, 30, 30, 55, 55, 80, 80, 90, 100]);
        assert!(steps.iter().any(|(_, s)| s == "Downloading driving network (1/2)..."));
    }

    #[tokio::test]
    async fn progress_never_exceeds_the_download_band() {
        let source = FakeSource { failing: vec![] };
        let req = MapRequest { walk: true, all: true, ..MapRequest::default() };
        let mut pcts = Vec::new();
        generate(&source, &FontLibrary::default(), &req, &mut |pct, _: &str| pcts.push(pct))
            .await
            .unwrap();
        assert_eq!(pcts, vec![10, 20, 30, 30, 42, 42, 55, 55, 67, 67, 80, 80, 90, 100]);
        assert!(pcts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn failed_network_is_a_warning() {
        let source = FakeSource { failing: vec![NetworkType::Drive] };
        let map = source.run(&MapRequest::default()).await.unwrap();
        assert_eq!(map.networks, vec!["Bike"]);
        assert!(map.notices.contains(&Notice::Warning(
            "Error downloading drive network: HTTP 504".into()
        )));
    }

    #[tokio::test]
    async fn all_networks_failing_is_fatal() {
        let source = FakeSource {
            failing: vec![NetworkType::Drive, NetworkType::Bike],
        };
        let err = source.run(&MapRequest::default()).await.unwrap_err();
        assert!(matches!(err, MapError::NoNetworks));
    }

    #[tokio::test]
    async fn unknown_city_stops_early() {
        let source = FakeSource { failing: vec![] };
        let req = MapRequest { city: "Atlantis".into(), ..MapRequest::default() };
        let err = source.run(&req).await.unwrap_err();
        assert!(matches!(err, MapError::CityNotFound(_)));
    }
}
