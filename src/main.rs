mod acquisition;
mod board;
mod error;
mod plot;
mod process;
mod series;
mod store;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionLoop, RunConfig};
use crate::board::{Board, FirmataBoard, PinMapping, SimulatedBoard};
use crate::plot::{channel_means, render_transmission_png, PlotStyle};
use crate::series::{Channel, Series};
use crate::store::SampleStore;

#[derive(Parser)]
#[command(
    name = "chromalux",
    version,
    about = "Light-transmission colorimeter control and analysis"
)]
struct Cli {
    /// Directory holding the measurement archives.
    #[arg(long, global = true, default_value = ".")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a measurement, checkpointing the archive after every cycle.
    Measure {
        /// Archive name for the run.
        name: String,
        /// Serial port of the board, e.g. /dev/ttyUSB0 or COM4.
        #[arg(long)]
        port: Option<String>,
        /// Use the simulated board instead of hardware.
        #[arg(long)]
        simulate: bool,
        /// Number of cycles (overrides the config file).
        #[arg(long)]
        cycles: Option<usize>,
        /// JSON file overriding the default run configuration.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load an archive, optionally filter it, write a PNG and print means.
    Plot {
        name: String,
        #[arg(long, value_enum, default_value = "raw")]
        mode: Mode,
        /// Lowpass cutoff frequency in Hz (lowpass mode).
        #[arg(long, default_value_t = 10.0)]
        cutoff: f64,
        /// Moving-average window in cycles (window mode).
        #[arg(long, default_value_t = 10)]
        window: usize,
        /// Extra annotation for the plot caption.
        #[arg(long, default_value = "")]
        note: String,
        /// Output PNG path (defaults to <name>.png).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print per-channel means and linear trends of an archive.
    Stats { name: String },
    /// Keep the first KEEP cycles of an archive under a new name.
    Trim {
        name: String,
        keep: usize,
        out_name: String,
    },
    /// Stitch a run and its continuation together under a new name.
    Concat {
        first: String,
        second: String,
        out_name: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Raw,
    Lowpass,
    Window,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let store = SampleStore::new(&cli.data_dir);
    match cli.command {
        Command::Measure {
            name,
            port,
            simulate,
            cycles,
            config,
        } => measure(store, &name, port, simulate, cycles, config),
        Command::Plot {
            name,
            mode,
            cutoff,
            window,
            note,
            out,
        } => render(store, &name, mode, cutoff, window, &note, out),
        Command::Stats { name } => stats(store, &name),
        Command::Trim {
            name,
            keep,
            out_name,
        } => trim(store, &name, keep, &out_name),
        Command::Concat {
            first,
            second,
            out_name,
        } => concat(store, &first, &second, &out_name),
    }
}

/// On-disk configuration: run parameters plus the pin wiring, either part
/// optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct InstrumentConfig {
    run: RunConfig,
    pins: PinMapping,
}

fn load_instrument_config(path: Option<PathBuf>) -> Result<InstrumentConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config = serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(InstrumentConfig::default()),
    }
}

fn measure(
    store: SampleStore,
    name: &str,
    port: Option<String>,
    simulate: bool,
    cycles: Option<usize>,
    config: Option<PathBuf>,
) -> Result<()> {
    let InstrumentConfig { mut run, pins } = load_instrument_config(config)?;
    if let Some(cycles) = cycles {
        run.cycles = cycles;
    }
    if store.exists(name) {
        log::warn!("archive '{name}' already exists and will be overwritten");
    }

    let board: Box<dyn Board> = if simulate {
        Box::new(SimulatedBoard::default().with_noise(0.01))
    } else {
        let Some(port) = port else {
            bail!("--port is required unless --simulate is given");
        };
        Box::new(
            FirmataBoard::open(&port, pins)
                .with_context(|| format!("opening board on {port}"))?,
        )
    };

    let series = AcquisitionLoop::new(board, run, store, name)?.run()?;
    println!("measured {} cycles into archive '{name}'", series.len());
    Ok(())
}

fn render(
    store: SampleStore,
    name: &str,
    mode: Mode,
    cutoff: f64,
    window: usize,
    note: &str,
    out: Option<PathBuf>,
) -> Result<()> {
    let series = store.load(name)?;
    let (series, annotation) = match mode {
        Mode::Raw => (series, "raw".to_string()),
        Mode::Lowpass => (
            process::lowpass(&series, cutoff)?,
            format!("LPF, fc = {cutoff}"),
        ),
        Mode::Window => (
            process::moving_average(&series, window)?,
            format!("WINDOW, len = {window}"),
        ),
    };
    let annotation = if note.is_empty() {
        annotation
    } else {
        format!("{annotation}, {note}")
    };

    let png = render_transmission_png(&series, name, &annotation, &PlotStyle::default())?;
    let out = out.unwrap_or_else(|| PathBuf::from(format!("{name}.png")));
    fs::write(&out, &png).with_context(|| format!("writing {}", out.display()))?;
    println!("wrote {}", out.display());
    print_means(&series);
    Ok(())
}

fn stats(store: SampleStore, name: &str) -> Result<()> {
    let series = store.load(name)?;
    println!("archive '{name}': {} cycles", series.len());
    print_means(&series);
    for channel in Channel::ALL {
        match process::linear_trend(&series, channel) {
            Ok((slope, intercept)) => println!(
                "{} trend: {slope:.6e} per s (intercept {intercept:.4})",
                channel.name()
            ),
            Err(e) => println!("{} trend: n/a ({e})", channel.name()),
        }
    }
    Ok(())
}

fn trim(store: SampleStore, name: &str, keep: usize, out_name: &str) -> Result<()> {
    let series = store.load(name)?;
    let cut = series.truncated(keep);
    store.save(&cut, out_name)?;
    println!(
        "kept {} of {} cycles as '{out_name}'",
        cut.len(),
        series.len()
    );
    Ok(())
}

fn concat(store: SampleStore, first: &str, second: &str, out_name: &str) -> Result<()> {
    let head = store.load(first)?;
    let tail = store.load(second)?;
    let joined = head.concat(&tail)?;
    store.save(&joined, out_name)?;
    println!(
        "stitched {} + {} cycles into '{out_name}'",
        head.len(),
        tail.len()
    );
    Ok(())
}

fn print_means(series: &Series) {
    let means = channel_means(series);
    for channel in Channel::ALL {
        println!("{} Mean: {}", channel.name(), means[channel.index()]);
    }
}
