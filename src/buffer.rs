use geo_types::{Coord, LineString, Polygon};

use crate::crs::Crs;
use crate::error::MapError;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Vertices on the buffer ring, matching 16 segments per quarter circle.
const CIRCLE_VERTICES: usize = 64;

/// Area around the city centre used to clip the street network.
#[derive(Debug, Clone)]
pub struct StudyArea {
    pub polygon: Polygon<f64>,
    pub radius_m: f64,
    pub crs: Crs,
}

impl StudyArea {
    pub fn wkt(&self) -> String {
        let coords: Vec<String> = self
            .polygon
            .exterior()
            .coords()
            .map(|c| format!("{} {}", c.x, c.y))
            .collect();
        format!("POLYGON (({}))", coords.join(", "))
    }

    /// Space-separated `lat lon` pairs for an Overpass `poly:` filter.
    pub fn overpass_poly(&self) -> String {
        let ring = &self.polygon.exterior().0;
        let open = &ring[..ring.len().saturating_sub(1)];
        open.iter()
            .map(|c| format!("{:.7} {:.7}", c.y, c.x))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Buffer a WGS 84 point by `buffer_meters`, measuring distance in `crs`.
pub fn create_city_buffer(
    latitude: f64,
    longitude: f64,
    buffer_meters: f64,
    crs: Crs,
) -> Result<StudyArea, MapError> {
    if !latitude.is_finite() || !longitude.is_finite() {
        return Err(MapError::Buffer("coordinates are not finite".into()));
    }
    if buffer_meters.is_nan() || buffer_meters <= 0.0 {
        return Err(MapError::Buffer(format!(
            "buffer radius must be positive, got {buffer_meters}"
        )));
    }

    let ring: Vec<Coord<f64>> = if crs.is_geographic() {
        tangent_plane_circle(latitude, longitude, buffer_meters)
    } else {
        projected_circle(latitude, longitude, buffer_meters, crs)
    };

    for c in &ring {
        if !c.x.is_finite() || !c.y.is_finite() || c.y.abs() > 90.0 || c.x.abs() > 180.0 {
            return Err(MapError::Buffer(format!(
                "buffer leaves the valid range of {} ({:.4}, {:.4})",
                crs.label(),
                c.x,
                c.y
            )));
        }
    }

    tracing::info!("Buffer created: {buffer_meters}m radius in EPSG:{}", crs.epsg());
    Ok(StudyArea {
        polygon: Polygon::new(LineString::from(ring), vec![]),
        radius_m: buffer_meters,
        crs,
    })
}

fn circle_angles() -> impl Iterator<Item = f64> {
    (0..CIRCLE_VERTICES).map(|i| i as f64 / CIRCLE_VERTICES as f64 * std::f64::consts::TAU)
}

fn projected_circle(latitude: f64, longitude: f64, buffer_meters: f64, crs: Crs) -> Vec<Coord<f64>> {
    let (cx, cy) = crs.forward(longitude, latitude);
    let r = buffer_meters * crs.units_per_meter();
    circle_angles()
        .map(|theta| {
            let (lon, lat) = crs.inverse(cx + r * theta.cos(), cy + r * theta.sin());
            Coord { x: lon, y: lat }
        })
        .collect()
}

fn tangent_plane_circle(latitude: f64, longitude: f64, buffer_meters: f64) -> Vec<Coord<f64>> {
    let dlat = (buffer_meters / EARTH_RADIUS_M).to_degrees();
    let dlon = (buffer_meters / (EARTH_RADIUS_M * latitude.to_radians().cos())).to_degrees();
    circle_angles()
        .map(|theta| Coord {
            x: longitude + dlon * theta.cos(),
            y: latitude + dlat * theta.sin(),
        })
        .collect()
}
