mod backend;
mod compositor;
mod config;
mod geom;
mod gpu;
mod waking_sender;

use std::{path::PathBuf, rc::Rc};

use anyhow::{Context as _, Result};
use clap::Parser;
use glam::UVec2;
use tracing::{debug, info};
use tracing_subscriber::{util::SubscriberInitExt as _, EnvFilter, Layer as _};

#[derive(Debug, Parser)]
#[command(name = "prismd")]
#[command(about = "A Wayland display server", long_about = None)]
struct Cli {
    /// Disable dmabuf buffer import; clients fall back to wl_shm.
    #[arg(long)]
    no_dmabuf: bool,
    /// Issue one draw call per rectangle instead of batching.
    #[arg(long)]
    separate_draws: bool,
    /// Enable the debug overlay.
    #[arg(long)]
    imgui: bool,
    /// Spawn Xwayland on the given display (e.g. ":1").
    #[arg(long, value_name = ":N")]
    xwayland: Option<String>,
    /// Append plain-text logs to this file in addition to stderr.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// The path to a config file.
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_logging(args.log_file.as_deref())?;
    debug!("starting up");

    let config = config::Config::load(args.config.as_deref()).context("failed to read config")?;

    let options = compositor::Options {
        no_dmabuf: args.no_dmabuf,
        separate_draws: args.separate_draws,
        imgui: args.imgui,
        xwayland: args.xwayland,
    };

    // The Vulkan device and the session backends plug in from the platform
    // layer; the in-tree pair is the software device driving virtual
    // outputs.
    let device: gpu::DeviceHandle = Rc::new(gpu::soft::SoftDevice::new());
    let backend = Box::new(backend::headless::HeadlessBackend::new(&[UVec2::new(
        1920, 1080,
    )]));

    let mut compositor = compositor::Compositor::new(device, backend, config, options)?;

    info!("running");
    compositor.run()
}

fn init_logging(log_file: Option<&std::path::Path>) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt as _;

    // The log file is append-only plain text; stderr keeps its colors.
    let file_log = if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;

        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .with_filter(EnvFilter::new("prismd=debug"));

        Some(layer)
    } else {
        None
    };

    let stderr_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive("prismd=info".parse()?)
                .from_env_lossy(),
        );

    tracing_subscriber::registry()
        .with(file_log)
        .with(stderr_log)
        .init();

    Ok(())
}
