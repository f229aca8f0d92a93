use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Cursor;

use geo_types::{LineString, Rect};

use crate::config::FIGURE_SIZE_IN;
use crate::error::MapError;
use crate::fonts::{CUSTOM_FAMILY, FontLibrary};
use crate::network::StreetNetwork;

const POINTS_PER_INCH: f64 = 72.0;
const AXIS_MARGIN: f64 = 0.02;
const EDGE_WIDTH_PT: f64 = 0.5;
const CITY_FONT_PT: f64 = 30.0;
const NETWORK_FONT_PT: f64 = 18.0;
const CITY_Y: f64 = 0.04;
const LABEL_GAP: f64 = 0.018;
const BACKGROUND: [u8; 3] = [0, 0, 0];

/// A map scene in point units, ready to rasterize at any DPI.
#[derive(Debug, Clone)]
pub struct MapFigure {
    svg: String,
    size_pt: f64,
    fonts: FontLibrary,
}

impl MapFigure {
    pub fn svg(&self) -> &str {
        &self.svg
    }

    /// Edge length in pixels of the square image at `dpi`.
    pub fn pixel_size(&self, dpi: u32) -> u32 {
        (self.size_pt / POINTS_PER_INCH * dpi as f64).round() as u32
    }
}

/// Lay out the street network, the city title and the network label.
pub fn generate_map_image(
    network: &StreetNetwork,
    city_name: &str,
    network_types: &str,
    fonts: &FontLibrary,
) -> Result<MapFigure, MapError> {
    let bounds = network
        .bounds()
        .ok_or_else(|| MapError::Render("the network has no edges to draw".into()))?;

    let size = FIGURE_SIZE_IN * POINTS_PER_INCH;
    let frame = Frame::fit(bounds, size);
    let family = if fonts.has_custom() {
        format!("{CUSTOM_FAMILY}, sans-serif")
    } else {
        "sans-serif".to_string()
    };

    let mut svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{size}" height="{size}" viewBox="0 0 {size} {size}">"##,
    );

    // A two-way street is stored as twin edges with reversed geometry; draw
    // one of them. Distinct pieces of a loop share endpoints but not geometry.
    let mut drawn = HashSet::new();
    let mut d = String::new();
    for (_, edge) in network.edges() {
        if !drawn.insert(street_key(edge.way_id, &edge.geometry)) {
            continue;
        }
        for (i, c) in edge.geometry.0.iter().enumerate() {
            let (x, y) = frame.project(c.x, c.y);
            let cmd = if i == 0 { 'M' } else { 'L' };
            let _ = write!(d, "{cmd}{x:.2},{y:.2} ");
        }
    }
    svg.push_str(&format!(
        r##"<path d="{}" fill="none" stroke="white" stroke-width="{EDGE_WIDTH_PT}" stroke-linejoin="round"/>"##,
        d.trim_end(),
    ));

    let city_y = frame.bottom - CITY_Y * frame.height;
    let network_y = frame.bottom - (CITY_Y + LABEL_GAP) * frame.height;
    let cx = frame.left + frame.width / 2.0;
    svg.push_str(&format!(
        r##"<text x="{cx:.2}" y="{city_y:.2}" font-family="{family}" font-size="{CITY_FONT_PT}" font-weight="bold" fill="white" text-anchor="middle">{}</text>"##,
        escape_xml(&title_case(city_name)),
    ));
    svg.push_str(&format!(
        r##"<text x="{cx:.2}" y="{network_y:.2}" font-family="{family}" font-size="{NETWORK_FONT_PT}" fill="white" text-anchor="middle">{}</text>"##,
        escape_xml(network_types),
    ));
    svg.push_str("</svg>");

    tracing::info!("Map visualization created successfully");
    Ok(MapFigure {
        svg,
        size_pt: size,
        fonts: fonts.clone(),
    })
}

/// Rasterize the figure at `dpi` over a black background and encode as PNG.
pub fn fig_to_bytes(figure: &MapFigure, dpi: u32) -> Result<Vec<u8>, MapError> {
    let pixmap = rasterize_svg(figure, dpi)?;
    let (w, h) = (pixmap.width(), pixmap.height());
    let composite = composite_over_background(pixmap.take(), BACKGROUND);
    let image = image::RgbaImage::from_raw(w, h, composite)
        .ok_or_else(|| MapError::Render("pixel buffer has the wrong size".into()))?;

    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| MapError::Render(format!("PNG encoding failed: {e}")))?;
    Ok(buf.into_inner())
}

/// File name offered for download, derived from the city name.
pub fn map_file_name(city_name: &str) -> String {
    format!(
        "{}_transport_map.png",
        city_name.replace(' ', "_").replace(',', "")
    )
}

/// Uppercase the first letter of each alphabetic run, lowercase the rest.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_letter = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_letter = true;
        } else {
            out.push(c);
            prev_letter = false;
        }
    }
    out
}

/// Way id plus the geometry in a direction-independent order.
fn street_key(way_id: i64, line: &LineString<f64>) -> (i64, Vec<(u64, u64)>) {
    let forward: Vec<(u64, u64)> = line.0.iter().map(|c| (c.x.to_bits(), c.y.to_bits())).collect();
    let mut reverse = forward.clone();
    reverse.reverse();
    (way_id, forward.min(reverse))
}

/// Equal-aspect placement of lon/lat data in the square figure.
struct Frame {
    min_lon: f64,
    max_lat: f64,
    x_scale: f64,
    scale: f64,
    left: f64,
    top: f64,
    bottom: f64,
    width: f64,
    height: f64,
}

impl Frame {
    fn fit(bounds: Rect<f64>, size: f64) -> Self {
        let mid_lat = (bounds.min().y + bounds.max().y) / 2.0;
        let x_scale = mid_lat.to_radians().cos();

        let mut dx = bounds.width() * x_scale;
        let mut dy = bounds.height();
        // A single point or a straight line still gets a visible extent.
        let floor = dx.max(dy).max(1e-6) * 1e-3;
        dx = dx.max(floor);
        dy = dy.max(floor);

        let (mx, my) = (dx * AXIS_MARGIN, dy * AXIS_MARGIN);
        let data_w = dx + 2.0 * mx;
        let data_h = dy + 2.0 * my;
        let scale = size / data_w.max(data_h);
        let width = data_w * scale;
        let height = data_h * scale;
        let left = (size - width) / 2.0;
        let top = (size - height) / 2.0;

        let centre_x = (bounds.min().x + bounds.max().x) / 2.0;
        let centre_y = (bounds.min().y + bounds.max().y) / 2.0;
        Frame {
            min_lon: centre_x - data_w / x_scale / 2.0,
            max_lat: centre_y + data_h / 2.0,
            x_scale,
            scale,
            left,
            top,
            bottom: top + height,
            width,
            height,
        }
    }

    fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        (
            self.left + (lon - self.min_lon) * self.x_scale * self.scale,
            self.top + (self.max_lat - lat) * self.scale,
        )
    }
}

pub(crate) fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn rasterize_svg(figure: &MapFigure, dpi: u32) -> Result<resvg::tiny_skia::Pixmap, MapError> {
    let opts = resvg::usvg::Options {
        fontdb: figure.fonts.database(),
        ..Default::default()
    };
    let tree = resvg::usvg::Tree::from_str(&figure.svg, &opts)
        .map_err(|e| MapError::Render(format!("failed to parse SVG scene: {e}")))?;

    let px = figure.pixel_size(dpi);
    let mut pixmap = resvg::tiny_skia::Pixmap::new(px, px)
        .ok_or_else(|| MapError::Render(format!("cannot allocate a {px}x{px} image")))?;

    let scale = px as f32 / tree.size().width();
    resvg::render(
        &tree,
        resvg::tiny_skia::Transform::from_scale(scale, scale),
        &mut pixmap.as_mut(),
    );
    Ok(pixmap)
}

/// Source-over of premultiplied RGBA onto an opaque colour, in place.
fn composite_over_background(mut data: Vec<u8>, background: [u8; 3]) -> Vec<u8> {
    for px in data.chunks_exact_mut(4) {
        let sa = px[3] as u32;
        let inv_sa = 255 - sa;
        for (channel, bg) in px[..3].iter_mut().zip(background) {
            *channel = (*channel as u32 + bg as u32 * inv_sa / 255).min(255) as u8;
        }
        px[3] = 255;
    }
    data
}
