use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use isomap::config::{DEFAULT_TILE_SIZE, start_resolution_for_tile};
use isomap::geo::tiles::TileCoord;
use isomap::render::rasterize;
use isomap::source::{CrowFliesSource, HttpSource};
use isomap::{
    BoundingBox, CacheStats, GeoPoint, HeatTile, RefineOutcome, RefinementConfig,
    RefinementDriver, TravelTimeSource, ValueBounds,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refine a heatmap around a destination and write it out
    Render(RenderArgs),

    /// Print the slippy-map tile containing a point
    Tile {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lng: f64,

        #[arg(short, long)]
        zoom: u8,

        /// Tile size in pixels
        #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
        tile_size: u32,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Straight-line distance at a constant speed
    Crow,
    /// JSON travel-time endpoint
    Http,
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Destination as LAT,LNG
    #[arg(short, long, allow_hyphen_values = true)]
    destination: GeoPoint,

    /// Viewport as WEST,SOUTH,EAST,NORTH; repeat to cycle through several
    #[arg(long, allow_hyphen_values = true)]
    viewport: Vec<BoundingBox>,

    /// Number of refinement rounds
    #[arg(short, long, default_value_t = 3)]
    rounds: usize,

    #[arg(long, value_enum, default_value_t = SourceKind::Crow)]
    source: SourceKind,

    /// URL template for the http source
    #[arg(long)]
    url: Option<String>,

    /// Request timeout for the http source, in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Travel speed for the crow source
    #[arg(long)]
    speed_kmh: Option<f64>,

    /// JSON file with refinement settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Side length of the root cell in meters
    #[arg(long, conflicts_with = "tile_zoom")]
    start_resolution: Option<f64>,

    /// Derive the root cell size from a 64 pixel tile at this zoom
    #[arg(long)]
    tile_zoom: Option<u8>,

    #[arg(long)]
    min_resolution: Option<f64>,

    /// Maximum number of evaluations in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Value stored for failed samples instead of leaving them unknown
    #[arg(long)]
    failure_value: Option<f64>,

    /// Output JSON file
    #[arg(short, long)]
    output: PathBuf,

    /// Also write a PNG heatmap
    #[arg(long)]
    png: Option<PathBuf>,

    #[arg(long, default_value_t = 1024)]
    width: u32,

    #[arg(long, default_value_t = 1024)]
    height: u32,
}

#[derive(Serialize)]
struct RenderOutput {
    destination: GeoPoint,
    generation: u64,
    bounds: Option<ValueBounds>,
    cache: Option<CacheStats>,
    tiles: Vec<HeatTile>,
}

impl RenderArgs {
    fn refinement_config(&self) -> Result<RefinementConfig> {
        let mut config = match &self.config {
            Some(path) => RefinementConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => RefinementConfig::default(),
        };

        if let Some(zoom) = self.tile_zoom {
            config.start_resolution_meters =
                start_resolution_for_tile(self.destination.lat, zoom, DEFAULT_TILE_SIZE);
        }
        if let Some(meters) = self.start_resolution {
            config.start_resolution_meters = meters;
        }
        if let Some(meters) = self.min_resolution {
            config.min_resolution_meters = meters;
        }
        if let Some(limit) = self.concurrency {
            config.concurrency_limit = limit;
        }
        if self.failure_value.is_some() {
            config.failure_value = self.failure_value;
        }

        config.validate().context("Invalid refinement settings")?;
        Ok(config)
    }
}

async fn render<S: TravelTimeSource>(args: &RenderArgs, source: S, config: RefinementConfig) -> Result<()> {
    let start_resolution = config.start_resolution_meters;
    let driver = RefinementDriver::new(source, config).context("Failed to create refinement driver")?;
    let generation = driver.set_destination(args.destination);

    for round in 0..args.rounds {
        let viewport = match args.viewport.len() {
            0 => None,
            n => Some(args.viewport[round % n]),
        };

        info!("Round {} of {}", round + 1, args.rounds);
        match driver.refine_viewport(viewport).await {
            RefineOutcome::Applied { tiles, bounds_changed, .. } => {
                if let Some(bounds) = bounds_changed {
                    info!("Bounds now {:.0}..{:.0} s", bounds.min, bounds.max);
                }
                info!("{} tiles after round {}", tiles.len(), round + 1);
            }
            other => bail!("Refinement did not apply: {:?}", other),
        }
    }

    let tiles = driver.tiles().await;
    let bounds = driver.bounds();

    let output = RenderOutput {
        destination: args.destination,
        generation,
        bounds,
        cache: driver.cache_stats(),
        tiles,
    };
    let json = serde_json::to_string_pretty(&output).context("Failed to serialize heatmap")?;
    std::fs::write(&args.output, json)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    info!("Wrote {} tiles to {}", output.tiles.len(), args.output.display());

    if let Some(png) = &args.png {
        let area = args
            .viewport
            .first()
            .copied()
            .unwrap_or_else(|| BoundingBox::square(args.destination, start_resolution));
        let image = rasterize(&output.tiles, &area, bounds, args.width, args.height);
        image
            .save(png)
            .with_context(|| format!("Failed to write {}", png.display()))?;
        info!("Wrote heatmap to {}", png.display());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Render(args) => {
            let config = args.refinement_config()?;
            match args.source {
                SourceKind::Crow => {
                    let source = match args.speed_kmh {
                        Some(speed) => CrowFliesSource::new(speed).context("Invalid travel speed")?,
                        None => CrowFliesSource::default(),
                    };
                    render(args, source, config).await?;
                }
                SourceKind::Http => {
                    let Some(url) = &args.url else {
                        bail!("--url is required for the http source");
                    };
                    let source = HttpSource::new(url.clone(), Duration::from_secs(args.timeout_secs))
                        .context("Failed to create HTTP client")?;
                    render(args, source, config).await?;
                }
            }
        }

        Commands::Tile { lat, lng, zoom, tile_size } => {
            let point = GeoPoint::new(*lat, *lng);
            let tile = TileCoord::from_lat_lng(&point, *zoom, *tile_size);
            println!("{}", tile);
            println!("bounds: {}", tile.bounds());
            println!("center: {}", tile.center());
            println!("width: {:.1} m ({:.2} m/px)", tile.width_meters(), tile.meters_per_pixel());
            println!(
                "start resolution: {:.1} m",
                start_resolution_for_tile(*lat, *zoom, *tile_size)
            );
        }
    }

    Ok(())
}
