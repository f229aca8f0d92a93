mod buffer;
mod cache;
mod config;
mod crs;
mod error;
mod fonts;
mod geocode;
mod network;
mod osm;
mod pipeline;
mod render;
#[cfg(test)]
mod testing;
mod web;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::Caches;
use crate::fonts::FontLibrary;
use crate::osm::NetworkType;
use crate::pipeline::{MapContext, MapRequest, generate, group_thousands};

#[derive(Parser)]
#[command(
    name = "citymap",
    about = "City transport map generator from OpenStreetMap street networks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web front-end
    Serve {
        /// Address to listen on
        #[arg(long, env = "CITYMAP_BIND", default_value = config::DEFAULT_BIND)]
        bind: String,

        /// Directory for downloaded OSM data and fonts
        #[arg(long, env = "CITYMAP_DATA_DIR", default_value = config::DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
    },

    /// Generate a single map as a PNG file
    Render {
        /// City to map; include state/country for better results
        #[arg(short, long, default_value = config::DEFAULT_CITY)]
        city: String,

        /// Map radius in kilometres
        #[arg(short, long, default_value_t = config::DEFAULT_RADIUS_KM)]
        radius_km: u32,

        /// EPSG code of the coordinate system (see `citymap crs`)
        #[arg(long, default_value_t = config::DEFAULT_EPSG)]
        crs: u32,

        /// Network to include; repeat for several
        #[arg(short, long = "network", value_enum, default_values_t = [NetworkType::Drive, NetworkType::Bike])]
        networks: Vec<NetworkType>,

        /// Image resolution
        #[arg(long, default_value_t = config::DEFAULT_DPI)]
        dpi: u32,

        /// Output file path (defaults to <City>_transport_map.png)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for downloaded OSM data and fonts
        #[arg(long, env = "CITYMAP_DATA_DIR", default_value = config::DEFAULT_DATA_DIR)]
        data_dir: PathBuf,

        /// Clear cached data before rendering
        #[arg(long)]
        no_cache: bool,
    },

    /// List supported coordinate systems
    Crs,
}

fn build_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(config::USER_AGENT)
        .build()?)
}

async fn build_context(data_dir: &Path) -> Result<MapContext> {
    let client = build_client()?;
    let caches = Caches::new(data_dir.join(config::OSM_CACHE_SUBDIR));
    let custom = fonts::load_custom_font(&client, &data_dir.join(config::FONT_SUBDIR)).await;
    let fonts = FontLibrary::load(custom);
    Ok(MapContext {
        client,
        caches,
        fonts,
    })
}

async fn serve(bind: &str, data_dir: &Path) -> Result<()> {
    let ctx = build_context(data_dir).await?;
    let app = web::create_router(web::AppState::new(ctx));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn render_to_file(
    request: MapRequest,
    output: Option<PathBuf>,
    data_dir: &Path,
) -> Result<()> {
    let ctx = build_context(data_dir).await?;
    let mut progress = |pct: u8, status: &str| tracing::info!("[{pct:>3}%] {status}");
    let map = generate(&ctx, &ctx.fonts, &request, &mut progress).await?;

    for notice in &map.notices {
        tracing::info!("{notice:?}");
    }

    let output = output.unwrap_or_else(|| PathBuf::from(&map.file_name));
    let dpi = map.dpi;
    let figure = map.figure.clone();
    let png = tokio::task::spawn_blocking(move || render::fig_to_bytes(&figure, dpi)).await??;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output, &png)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let size = map.figure.pixel_size(dpi);
    println!(
        "Saved {} ({size}x{size} px, {} nodes, {} edges)",
        output.display(),
        group_thousands(map.node_count),
        group_thousands(map.edge_count),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "citymap=info,tower_http=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, data_dir } => {
            serve(&bind, &data_dir).await?;
        }

        Commands::Render {
            city,
            radius_km,
            crs,
            networks,
            dpi,
            output,
            data_dir,
            no_cache,
        } => {
            if no_cache {
                osm::clear_cache(&data_dir.join(config::OSM_CACHE_SUBDIR));
            }
            let request = MapRequest {
                city,
                radius_km,
                crs,
                drive: networks.contains(&NetworkType::Drive),
                bike: networks.contains(&NetworkType::Bike),
                walk: networks.contains(&NetworkType::Walk),
                all: networks.contains(&NetworkType::All),
                dpi,
            };
            render_to_file(request, output, &data_dir).await?;
        }

        Commands::Crs => {
            for option in crs::options() {
                println!("{:>6}  {}", option.epsg, option.label);
            }
        }
    }

    Ok(())
}
