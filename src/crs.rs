use serde::Serialize;
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use crate::error::MapError;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const GRS80_F: f64 = 1.0 / 298.257_222_101;
const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const US_SURVEY_FEET_PER_METER: f64 = 3937.0 / 1200.0;

/// Coordinate systems offered in the settings form, in display order.
pub const CRS_OPTIONS: [(u32, &str); 12] = [
    (4326, "WGS 84 (Global)"),
    (3857, "Web Mercator"),
    (2277, "Texas State Plane (North Central)"),
    (32610, "UTM Zone 10N (West US)"),
    (32633, "UTM Zone 33N (Europe)"),
    (32643, "UTM Zone 43N (India West/Central)"),
    (32644, "UTM Zone 44N (India Central/East)"),
    (32645, "UTM Zone 45N (India East/Bangladesh)"),
    (32646, "UTM Zone 46N (Bangladesh East)"),
    (32647, "UTM Zone 47N (Thailand/Myanmar)"),
    (32648, "UTM Zone 48N (Vietnam)"),
    (32651, "UTM Zone 51N (Japan/Korea)"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crs {
    Wgs84,
    WebMercator,
    /// NAD83 / Texas North Central (ftUS).
    TexasNorthCentral,
    UtmNorth(u8),
}

#[derive(Debug, Serialize)]
pub struct CrsOption {
    pub epsg: u32,
    pub label: &'static str,
}

pub fn options() -> Vec<CrsOption> {
    CRS_OPTIONS
        .iter()
        .map(|&(epsg, label)| CrsOption { epsg, label })
        .collect()
}

impl Crs {
    pub fn from_epsg(code: u32) -> Result<Self, MapError> {
        if !CRS_OPTIONS.iter().any(|&(epsg, _)| epsg == code) {
            return Err(MapError::UnsupportedCrs(code));
        }
        Ok(match code {
            4326 => Crs::Wgs84,
            3857 => Crs::WebMercator,
            2277 => Crs::TexasNorthCentral,
            // Listed UTM codes are all 326zz.
            c => Crs::UtmNorth((c - 32600) as u8),
        })
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
            Crs::TexasNorthCentral => 2277,
            Crs::UtmNorth(zone) => 32600 + *zone as u32,
        }
    }

    pub fn label(&self) -> &'static str {
        let code = self.epsg();
        CRS_OPTIONS
            .iter()
            .find(|&&(epsg, _)| epsg == code)
            .map(|&(_, label)| label)
            .unwrap_or("Unknown")
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Wgs84)
    }

    /// Linear units per metre. Geographic systems report 1; callers buffer those
    /// on a local tangent plane instead.
    pub fn units_per_meter(&self) -> f64 {
        match self {
            Crs::TexasNorthCentral => US_SURVEY_FEET_PER_METER,
            _ => 1.0,
        }
    }

    /// WGS 84 degrees to projected coordinates.
    pub fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Crs::Wgs84 => (lon, lat),
            Crs::WebMercator => mercator_forward(lon, lat),
            Crs::TexasNorthCentral => {
                let (x, y) = texas_lcc().forward(lon, lat);
                (x * US_SURVEY_FEET_PER_METER, y * US_SURVEY_FEET_PER_METER)
            }
            Crs::UtmNorth(zone) => tm_forward(lon, lat, utm_central_meridian(*zone)),
        }
    }

    /// Projected coordinates back to WGS 84 degrees.
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Crs::Wgs84 => (x, y),
            Crs::WebMercator => mercator_inverse(x, y),
            Crs::TexasNorthCentral => {
                texas_lcc().inverse(x / US_SURVEY_FEET_PER_METER, y / US_SURVEY_FEET_PER_METER)
            }
            Crs::UtmNorth(zone) => tm_inverse(x, y, utm_central_meridian(*zone)),
        }
    }
}

// --- Web Mercator (spherical) ---

fn mercator_forward(lon: f64, lat: f64) -> (f64, f64) {
    let x = WGS84_A * lon.to_radians();
    let y = WGS84_A * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

fn mercator_inverse(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / WGS84_A).to_degrees();
    let lat = (2.0 * (y / WGS84_A).exp().atan() - FRAC_PI_2).to_degrees();
    (lon, lat)
}

// --- Transverse Mercator on WGS 84 (UTM) ---

fn utm_central_meridian(zone: u8) -> f64 {
    zone as f64 * 6.0 - 183.0
}

/// Coefficients of the 6th-order Krüger series (Karney 2011): rectifying
/// radius plus the forward (alpha) and inverse (beta) trigonometric terms.
struct Kruger {
    e: f64,
    radius: f64,
    alpha: [f64; 6],
    beta: [f64; 6],
}

fn kruger() -> Kruger {
    let n = WGS84_F / (2.0 - WGS84_F);
    let (n2, n3, n4, n5, n6) = (n * n, n.powi(3), n.powi(4), n.powi(5), n.powi(6));
    Kruger {
        e: (WGS84_F * (2.0 - WGS84_F)).sqrt(),
        radius: WGS84_A / (1.0 + n) * (1.0 + n2 / 4.0 + n4 / 64.0 + n6 / 256.0),
        alpha: [
            n / 2.0 - 2.0 * n2 / 3.0 + 5.0 * n3 / 16.0 + 41.0 * n4 / 180.0
                - 127.0 * n5 / 288.0
                + 7891.0 * n6 / 37800.0,
            13.0 * n2 / 48.0 - 3.0 * n3 / 5.0 + 557.0 * n4 / 1440.0 + 281.0 * n5 / 630.0
                - 1_983_433.0 * n6 / 1_935_360.0,
            61.0 * n3 / 240.0 - 103.0 * n4 / 140.0
                + 15061.0 * n5 / 26880.0
                + 167_603.0 * n6 / 181_440.0,
            49561.0 * n4 / 161_280.0 - 179.0 * n5 / 168.0 + 6_601_661.0 * n6 / 7_257_600.0,
            34729.0 * n5 / 80640.0 - 3_418_889.0 * n6 / 1_995_840.0,
            212_378_941.0 * n6 / 319_334_400.0,
        ],
        beta: [
            n / 2.0 - 2.0 * n2 / 3.0 + 37.0 * n3 / 96.0 - n4 / 360.0 - 81.0 * n5 / 512.0
                + 96199.0 * n6 / 604_800.0,
            n2 / 48.0 + n3 / 15.0 - 437.0 * n4 / 1440.0 + 46.0 * n5 / 105.0
                - 1_118_711.0 * n6 / 3_870_720.0,
            17.0 * n3 / 480.0 - 37.0 * n4 / 840.0 - 209.0 * n5 / 4480.0 + 5569.0 * n6 / 90720.0,
            4397.0 * n4 / 161_280.0 - 11.0 * n5 / 504.0 - 830_251.0 * n6 / 7_257_600.0,
            4583.0 * n5 / 161_280.0 - 108_847.0 * n6 / 3_991_680.0,
            20_648_693.0 * n6 / 638_668_800.0,
        ],
    }
}

impl Kruger {
    /// tan of the conformal latitude for tan(phi) = `tau`.
    fn conformal_tan(&self, tau: f64) -> f64 {
        let sigma = (self.e * (self.e * tau / tau.hypot(1.0)).atanh()).sinh();
        tau * sigma.hypot(1.0) - sigma * tau.hypot(1.0)
    }
}

fn tm_forward(lon: f64, lat: f64, lon0: f64) -> (f64, f64) {
    let k = kruger();
    let lambda = (lon - lon0).to_radians();
    let tau_p = k.conformal_tan(lat.to_radians().tan());

    let xi_p = tau_p.atan2(lambda.cos());
    let eta_p = (lambda.sin() / tau_p.hypot(lambda.cos())).asinh();
    let (mut xi, mut eta) = (xi_p, eta_p);
    for (j, a) in k.alpha.iter().enumerate() {
        let m = 2.0 * (j + 1) as f64;
        xi += a * (m * xi_p).sin() * (m * eta_p).cosh();
        eta += a * (m * xi_p).cos() * (m * eta_p).sinh();
    }
    (
        UTM_FALSE_EASTING + UTM_K0 * k.radius * eta,
        UTM_K0 * k.radius * xi,
    )
}

fn tm_inverse(x: f64, y: f64, lon0: f64) -> (f64, f64) {
    let k = kruger();
    let xi = y / (UTM_K0 * k.radius);
    let eta = (x - UTM_FALSE_EASTING) / (UTM_K0 * k.radius);
    let (mut xi_p, mut eta_p) = (xi, eta);
    for (j, b) in k.beta.iter().enumerate() {
        let m = 2.0 * (j + 1) as f64;
        xi_p -= b * (m * xi).sin() * (m * eta).cosh();
        eta_p -= b * (m * xi).cos() * (m * eta).sinh();
    }

    let tau_p = xi_p.sin() / eta_p.sinh().hypot(xi_p.cos());
    let lambda = eta_p.sinh().atan2(xi_p.cos());

    // Newton iteration from conformal back to geodetic latitude.
    let e2 = k.e * k.e;
    let mut tau = tau_p;
    for _ in 0..10 {
        let tau_i = k.conformal_tan(tau);
        let step = (tau_p - tau_i) / tau_i.hypot(1.0) * (1.0 + (1.0 - e2) * tau * tau)
            / ((1.0 - e2) * tau.hypot(1.0));
        tau += step;
        if step.abs() < 1e-14 {
            break;
        }
    }
    (lon0 + lambda.to_degrees(), tau.atan().to_degrees())
}

// --- Lambert Conformal Conic, two standard parallels ---

struct Lcc {
    e: f64,
    n: f64,
    af: f64,
    rho0: f64,
    lon0: f64,
    false_easting: f64,
    false_northing: f64,
}

fn texas_lcc() -> Lcc {
    Lcc::new(
        GRS80_F,
        33.0 + 58.0 / 60.0,
        32.0 + 8.0 / 60.0,
        31.0 + 40.0 / 60.0,
        -98.5,
        600_000.0,
        2_000_000.0,
    )
}

impl Lcc {
    fn new(f: f64, lat1: f64, lat2: f64, lat0: f64, lon0: f64, fe: f64, fn_: f64) -> Self {
        let e = (f * (2.0 - f)).sqrt();
        let m = |phi: f64| phi.cos() / (1.0 - (e * phi.sin()).powi(2)).sqrt();
        let (p1, p2, p0) = (lat1.to_radians(), lat2.to_radians(), lat0.to_radians());
        let (m1, m2) = (m(p1), m(p2));
        let (t1, t2, t0) = (lcc_t(p1, e), lcc_t(p2, e), lcc_t(p0, e));
        let n = (m1.ln() - m2.ln()) / (t1.ln() - t2.ln());
        let af = WGS84_A * m1 / (n * t1.powf(n));
        Lcc {
            e,
            n,
            af,
            rho0: af * t0.powf(n),
            lon0,
            false_easting: fe,
            false_northing: fn_,
        }
    }

    /// Output in metres.
    fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let rho = self.af * lcc_t(lat.to_radians(), self.e).powf(self.n);
        let theta = self.n * (lon - self.lon0).to_radians();
        (
            self.false_easting + rho * theta.sin(),
            self.false_northing + self.rho0 - rho * theta.cos(),
        )
    }

    fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x - self.false_easting;
        let dy = self.rho0 - (y - self.false_northing);
        let rho = self.n.signum() * dx.hypot(dy);
        let theta = (dx * self.n.signum()).atan2(dy * self.n.signum());
        let t = (rho / self.af).powf(1.0 / self.n);

        let mut phi = FRAC_PI_2 - 2.0 * t.atan();
        for _ in 0..15 {
            let es = self.e * phi.sin();
            let next = FRAC_PI_2 - 2.0 * (t * ((1.0 - es) / (1.0 + es)).powf(self.e / 2.0)).atan();
            if (next - phi).abs() < 1e-12 {
                phi = next;
                break;
            }
            phi = next;
        }
        (self.lon0 + (theta / self.n).to_degrees(), phi.to_degrees())
    }
}

fn lcc_t(phi: f64, e: f64) -> f64 {
    let es = e * phi.sin();
    (FRAC_PI_4 - phi / 2.0).tan() / ((1.0 - es) / (1.0 + es)).powf(e / 2.0)
}
