//! EPD driver demo binary.
//!
//! Loads the panel's waveform table, starts the driver and exercises it
//! with one of a few built-in scenarios:
//! - clear the screen,
//! - draw per-mode gradient test blocks,
//! - display an image file,
//! - trace an immediate-mode stylus spiral.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use epdfb::config::Config;
use epdfb::update::Region;
use epdfb::waveform::Intensity;
use epdfb::{Driver, DriverOptions, ModeKind, PanelController, PanelGeometry, WaveformTable};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "epdfb")]
#[command(about = "Userspace grayscale driver for electrophoretic display panels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = epdfb::config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Waveform file path (overrides config and discovery)
    #[arg(long)]
    wbf: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Clear the screen and exit
    #[arg(long)]
    clear: bool,

    /// Draw per-mode gradient test blocks and exit
    #[arg(long)]
    test: bool,

    /// Display an image file and exit
    #[arg(long)]
    image: Option<PathBuf>,

    /// Trace an immediate-mode spiral and exit
    #[arg(long)]
    spiral: bool,

    /// Write a CSV performance report to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

/// The driver threads are plain OS threads; the current-thread runtime
/// only serves signal handling around the demo scenario.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config = Config::load(&args.config).unwrap_or_else(|e| {
        tracing::debug!("No config loaded from {}: {}", args.config, e);
        Config::default()
    });

    let wbf_path = args
        .wbf
        .clone()
        .or_else(|| config.waveform_path.clone())
        .or_else(epdfb::waveform::wbf::discover_wbf_file)
        .context("no waveform file configured and none discovered")?;

    tracing::info!("Loading waveform table from {}", wbf_path.display());
    let table = WaveformTable::from_wbf_at(&wbf_path, config.classify_temperature)?;
    tracing::info!(
        modes = table.mode_count(),
        frame_rate = table.frame_rate(),
        "Waveform table loaded"
    );

    let framebuffer_path = config
        .framebuffer_path
        .clone()
        .or_else(epdfb::panel::discover_framebuffer)
        .context("no framebuffer device configured and none discovered")?;
    let sensor_path = config
        .temperature_sensor_path
        .clone()
        .or_else(epdfb::panel::discover_temperature_sensor)
        .context("no temperature sensor configured and none discovered")?;

    let controller = PanelController::open(
        &framebuffer_path,
        &sensor_path,
        PanelGeometry::REMARKABLE2,
    )?;

    let options = DriverOptions {
        idle_timeout: config.idle_timeout(),
    };
    let driver = Arc::new(Driver::start(controller, table, options)?);

    if let Some(path) = &args.report {
        let sink = File::create(path)
            .with_context(|| format!("cannot create report file {}", path.display()))?;
        driver.enable_perf_report(sink)?;
    }

    // Run the selected scenario off the runtime thread so signals stay
    // responsive
    let scenario = select_scenario(&args);
    let demo_driver = Arc::clone(&driver);
    let demo = tokio::task::spawn_blocking(move || run_scenario(&demo_driver, scenario));

    tokio::select! {
        result = demo => {
            result??;
            tracing::info!("Scenario complete");
        }
        _ = wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    driver.stop();
    Ok(())
}

#[derive(Debug, Clone)]
enum Scenario {
    Clear,
    Test,
    Image(PathBuf),
    Spiral,
}

fn select_scenario(args: &Args) -> Scenario {
    if let Some(path) = &args.image {
        Scenario::Image(path.clone())
    } else if args.clear {
        Scenario::Clear
    } else if args.spiral {
        Scenario::Spiral
    } else {
        if !args.test {
            tracing::debug!("No scenario selected, defaulting to the test pattern");
        }
        Scenario::Test
    }
}

fn run_scenario(driver: &Driver, scenario: Scenario) -> anyhow::Result<()> {
    match scenario {
        Scenario::Clear => run_clear(driver),
        Scenario::Test => run_test_pattern(driver),
        Scenario::Image(path) => run_image(driver, &path),
        Scenario::Spiral => run_spiral(driver),
    }
}

/// Host-space dimensions of the visible grid (portrait tablet space).
fn host_dimensions(driver: &Driver) -> (u32, u32) {
    // The panel scans the grid with the axes swapped
    let geometry = driver.geometry();
    (geometry.visible_height, geometry.visible_width)
}

/// Force the whole screen back to white.
fn run_clear(driver: &Driver) -> anyhow::Result<()> {
    let (width, height) = host_dimensions(driver);
    let buffer = vec![30u8; (width * height) as usize];

    driver
        .submit(ModeKind::Init, false, Region::new(0, 0, width, height), &buffer)
        .context("INIT update rejected")?;
    driver.wait_for_all();
    Ok(())
}

/// Draw a column of intensity blocks for every classified mode kind.
fn run_test_pattern(driver: &Driver) -> anyhow::Result<()> {
    run_clear(driver)?;

    const BLOCK_SIZE: u32 = 100;
    const BLOCK_COUNT: u32 = 16;

    let mut buffer = vec![0u8; (BLOCK_SIZE * BLOCK_SIZE * BLOCK_COUNT) as usize];

    for (index, chunk) in buffer
        .chunks_exact_mut((BLOCK_SIZE * BLOCK_SIZE) as usize)
        .enumerate()
    {
        chunk.fill(index as Intensity * 2);
    }

    let kinds = [
        ModeKind::Du,
        ModeKind::Du4,
        ModeKind::A2,
        ModeKind::Gc16,
        ModeKind::Glr16,
    ];

    let mut column = 0;

    for kind in kinds {
        let region = Region::new(136, 120 + column * 150, BLOCK_SIZE, BLOCK_SIZE * BLOCK_COUNT);

        match driver.submit(kind, false, region, &buffer) {
            Some(_) => column += 1,
            None => tracing::warn!(%kind, "mode not available on this panel"),
        }
    }

    driver.wait_for_all();
    Ok(())
}

/// Grayscale an image and show it full screen.
fn run_image(driver: &Driver, path: &std::path::Path) -> anyhow::Result<()> {
    let (width, height) = host_dimensions(driver);

    let img = image::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let gray = img
        .resize_exact(width, height, image::imageops::FilterType::Triangle)
        .into_luma8();

    let buffer: Vec<Intensity> = gray.pixels().map(|p| (p.0[0] >> 3) & 0x1E).collect();

    run_clear(driver)?;
    driver
        .submit(ModeKind::Gc16, false, Region::new(0, 0, width, height), &buffer)
        .context("image update rejected")?;
    driver.wait_for_all();
    Ok(())
}

/// Trace an expanding square spiral of small immediate A2 updates,
/// imitating a stylus stroke.
fn run_spiral(driver: &Driver) -> anyhow::Result<()> {
    run_clear(driver)?;

    const SQUARE: u32 = 6;
    const STEPS: u32 = 700;

    let (width, height) = host_dimensions(driver);
    let buffer = vec![0u8; (SQUARE * SQUARE) as usize];

    let mut x = (width / 2) as i64;
    let mut y = (height / 2) as i64;
    let (mut dx, mut dy) = (1i64, 0i64);
    let mut leg = 1u32;
    let mut remaining = leg;
    let mut legs_done = 0u32;

    for _ in 0..STEPS {
        if x >= 0 && y >= 0 && (x as u32) + SQUARE <= width && (y as u32) + SQUARE <= height {
            driver.submit(
                ModeKind::A2,
                true,
                Region::new(y as u32, x as u32, SQUARE, SQUARE),
                &buffer,
            );
        }

        x += dx * i64::from(SQUARE);
        y += dy * i64::from(SQUARE);

        remaining -= 1;
        if remaining == 0 {
            // Turn left and lengthen the leg every second turn
            (dx, dy) = (-dy, dx);
            legs_done += 1;
            if legs_done % 2 == 0 {
                leg += 1;
            }
            remaining = leg;
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    driver.wait_for_all();
    Ok(())
}

/// Initialize tracing/logging.
///
/// Default level is "info"; use --verbose for "debug" during
/// development and troubleshooting.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("epdfb={level}").into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Wait for shutdown signals (SIGTERM, SIGINT).
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
