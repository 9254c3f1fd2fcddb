use std::{
    io::BufRead,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use beatcue_core::{
    library, AppConfig, BeatCueError, Command, CueLibrary, Engine, NullSink, OffsetDatabase,
    SimulatedSource, Sink, StaleTolerant, TrackIdentity, UdpSink,
};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Sender;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const LATENCY_STEP_MS: f64 = 1.0;

fn main() -> beatcue_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_live(args),
        Commands::Check { dir, normalize } => run_check(&dir, normalize),
        Commands::Offsets {
            file,
            target_version,
        } => run_offsets(&file, target_version.as_deref()),
    }
}

fn run_live(args: RunArgs) -> beatcue_core::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let library = match CueLibrary::load_all_with(&config.engine.cue_dir, config.engine.normalize_timelines) {
        Ok(library) => library,
        Err(err) => {
            tracing::warn!(
                dir = %config.engine.cue_dir.display(),
                error = %err,
                "cannot read cue directory, running without cues"
            );
            CueLibrary::new()
        }
    };

    let sink: Box<dyn Sink> = if config.osc.enabled {
        Box::new(UdpSink::new(&config.osc.source_addr, &config.osc.target_addr)?)
    } else {
        tracing::info!("OSC output disabled, pass -o to enable");
        Box::new(NullSink)
    };

    let simulator = &config.simulator;
    tracing::info!(
        tempo = simulator.tempo,
        artist = %simulator.artist,
        title = %simulator.title,
        "using simulated source"
    );
    let source = StaleTolerant::new(SimulatedSource::new(
        simulator.tempo,
        TrackIdentity::new(&simulator.artist, &simulator.title),
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
        .map_err(|err| BeatCueError::msg(format!("cannot install Ctrl-C handler: {err}")))?;

    let (tx, rx) = crossbeam_channel::unbounded();
    spawn_console(tx);
    println!("Enter i/k to shift latency by ±{LATENCY_STEP_MS} ms, c to quit.");

    let mut engine = Engine::new(source, sink, library, &config.engine);
    engine.run(&rx, &stop)
}

/// Maps console lines to engine commands on a background thread.
fn spawn_console(tx: Sender<Command>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let command = match line.trim() {
                "i" => Command::NudgeLatency {
                    millis: LATENCY_STEP_MS,
                },
                "k" => Command::NudgeLatency {
                    millis: -LATENCY_STEP_MS,
                },
                "c" | "q" => Command::Stop,
                "" => continue,
                other => {
                    tracing::warn!(input = other, "unknown command");
                    continue;
                }
            };
            if tx.send(command).is_err() {
                break;
            }
        }
    });
}

#[derive(Debug, Serialize)]
struct SheetReport {
    file: PathBuf,
    events: usize,
    instants: usize,
    titles: Vec<String>,
    artists: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn run_check(dir: &Path, normalize: bool) -> beatcue_core::Result<()> {
    tracing::info!(?dir, normalize, "checking timelines");

    let reports: Vec<SheetReport> = library::timeline_files(dir)?
        .into_iter()
        .map(|file| match library::load_file(&file, normalize) {
            Ok(sheet) => SheetReport {
                events: sheet.event_count(),
                instants: sheet.instants().len(),
                titles: sheet.match_titles().to_vec(),
                artists: sheet.match_artists().to_vec(),
                error: None,
                file,
            },
            Err(err) => SheetReport {
                file,
                events: 0,
                instants: 0,
                titles: Vec::new(),
                artists: Vec::new(),
                error: Some(err.to_string()),
            },
        })
        .collect();

    let json = serde_json::to_string_pretty(&reports)
        .map_err(|err| BeatCueError::msg(err.to_string()))?;
    println!("{json}");

    let failed = reports.iter().filter(|report| report.error.is_some()).count();
    if failed > 0 {
        return Err(BeatCueError::msg(format!("{failed} timeline(s) failed to parse")));
    }
    Ok(())
}

fn run_offsets(file: &Path, target_version: Option<&str>) -> beatcue_core::Result<()> {
    let database = OffsetDatabase::load(file)?;
    for version in database.versions() {
        println!("{version}");
    }
    let layout = database.resolve(target_version)?;
    tracing::info!(version = %layout.version, "target version resolved");
    println!("targeting {}", layout.version);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronized cue playback for live DJ sets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the performance and fire cues.
    Run(RunArgs),
    /// Parse every timeline in a directory and report the result as JSON.
    Check {
        /// Directory holding `.tsv`/`.txt` timelines.
        dir: PathBuf,
        /// Rewrite each valid timeline in normalized form.
        #[arg(long)]
        normalize: bool,
    },
    /// Validate an offset database and resolve the target version.
    Offsets {
        /// Offset database file.
        file: PathBuf,
        /// Version to resolve; defaults to the latest one in the file.
        #[arg(short = 'v', long)]
        target_version: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding the cue timelines.
    #[arg(long)]
    cues: Option<PathBuf>,
    /// Enable OSC output.
    #[arg(short, long)]
    osc: bool,
    /// Local UDP address to send from (host:port).
    #[arg(short, long)]
    src: Option<String>,
    /// OSC destination (host:port).
    #[arg(short = 't', long)]
    dst: Option<String>,
    /// Rewrite timelines in normalized form while loading.
    #[arg(long)]
    normalize: bool,
    /// Tempo of the simulated deck.
    #[arg(long)]
    tempo: Option<f64>,
    /// Artist reported by the simulated deck.
    #[arg(long)]
    artist: Option<String>,
    /// Title reported by the simulated deck.
    #[arg(long)]
    title: Option<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(cues) = &self.cues {
            config.engine.cue_dir = cues.clone();
        }
        if self.osc {
            config.osc.enabled = true;
        }
        if let Some(src) = &self.src {
            config.osc.source_addr = src.clone();
        }
        if let Some(dst) = &self.dst {
            config.osc.target_addr = dst.clone();
        }
        if self.normalize {
            config.engine.normalize_timelines = true;
        }
        if let Some(tempo) = self.tempo {
            config.simulator.tempo = tempo;
        }
        if let Some(artist) = &self.artist {
            config.simulator.artist = artist.clone();
        }
        if let Some(title) = &self.title {
            config.simulator.title = title.clone();
        }
    }
}
