//! CLI Entry Point for lsci-session
//!
//! Provides command-line interface for:
//! - Running a session with an operator console on stdin
//! - Validating a configuration file
//! - Estimating how long a session will take
//!
//! # Usage
//!
//! Run a session, typing `start`, `pause`, `resume`, `next` or `stop`:
//! ```bash
//! lsci-session run --config config/session.toml
//! ```
//!
//! Run unattended on simulated hardware, faster than real time:
//! ```bash
//! lsci-session run --config config/session.toml --autopilot --virtual-time
//! ```
//!
//! Devices are the simulated ones from `hardware::mock`; a lab build swaps in
//! vendor implementations of the capability traits here.

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use lsci_session::config::SessionConfig;
use lsci_session::data::{CsvEventLog, SessionLayout};
use lsci_session::experiment::{
    EngineHandle, ExperimentEngine, ExperimentState, SessionHardware, SessionQueue,
};
use lsci_session::hardware::capabilities::StimulusDisplay;
use lsci_session::hardware::mock::{MockAudio, MockDisplay, MockFrameSource};
use lsci_session::hardware::{CameraCoordinator, Clock, MonotonicClock, SimClock};
use lsci_session::messages::{ControlIntent, ProgressNotification};
use lsci_session::tracing_setup;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lsci-session")]
#[command(about = "Hardware-synchronized LSCI imagery session controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session
    Run {
        /// Session configuration file
        #[arg(long, default_value = "config/session.toml")]
        config: PathBuf,

        /// Replace the configured subject list
        #[arg(long = "subject")]
        subjects: Vec<String>,

        /// Start immediately and confirm every turn without operator input
        #[arg(long)]
        autopilot: bool,

        /// Drive the simulated display from a virtual clock
        #[arg(long)]
        virtual_time: bool,
    },

    /// Load and validate a configuration file
    Validate {
        #[arg(long, default_value = "config/session.toml")]
        config: PathBuf,
    },

    /// Print the trial count and estimated session duration
    Estimate {
        #[arg(long, default_value = "config/session.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            subjects,
            autopilot,
            virtual_time,
        } => run_session(config, subjects, autopilot, virtual_time).await,
        Commands::Validate { config } => validate(config),
        Commands::Estimate { config } => estimate(config),
    }
}

fn load(path: &PathBuf, subjects: Vec<String>) -> Result<SessionConfig> {
    let mut config = SessionConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    if !subjects.is_empty() {
        config.session.subjects = subjects;
        config.validate()?;
    }
    Ok(config)
}

fn validate(path: PathBuf) -> Result<()> {
    let config = load(&path, Vec::new())?;
    println!("✅ {} is valid", path.display());
    println!("   Subjects:  {}", config.session.subjects.join(", "));
    println!(
        "   Shapes:    {}",
        config
            .session
            .shapes
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("   Recording: {:.3} s per cycle", config.recording_duration());
    Ok(())
}

fn estimate(path: PathBuf) -> Result<()> {
    let config = load(&path, Vec::new())?;
    let queue = SessionQueue::build(&config);
    let per_trial = SessionQueue::estimated_trial_duration(&config);
    let total = queue.estimated_remaining(&config);
    println!("📋 {} trials", queue.total());
    println!("   Per trial: {:.1} s", per_trial.as_secs_f64());
    println!(
        "   Session:   {:.1} min (ends about {})",
        total.as_secs_f64() / 60.0,
        queue
            .estimated_end_time(&config, Local::now())
            .format("%H:%M:%S")
    );
    Ok(())
}

async fn run_session(
    path: PathBuf,
    subjects: Vec<String>,
    autopilot: bool,
    virtual_time: bool,
) -> Result<()> {
    let config = load(&path, subjects)?;
    tracing_setup::init_from_config(&config)?;

    let (clock, display): (Arc<dyn Clock>, Box<dyn StimulusDisplay>) = if virtual_time {
        let sim = SimClock::new();
        let display = MockDisplay::virtual_time(config.display.refresh_rate_hz, sim.clone());
        let clock: Arc<dyn Clock> = Arc::new(sim);
        (clock, Box::new(display) as Box<dyn StimulusDisplay>)
    } else {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let display = MockDisplay::real_time(config.display.refresh_rate_hz, Arc::clone(&clock));
        (clock, Box::new(display) as Box<dyn StimulusDisplay>)
    };

    let camera = CameraCoordinator::spawn(
        Box::new(MockFrameSource::new(Arc::clone(&clock))),
        &config.camera,
    )?;
    let layout = SessionLayout::create(&config, Local::now())?;
    let event_log = CsvEventLog::create(layout.event_log_path())?;
    info!(root = ?layout.root(), "Session output directory");

    let hardware = SessionHardware {
        display,
        audio: Arc::new(MockAudio::new(Arc::clone(&clock))),
        camera: camera.handle(),
        clock,
    };
    let (engine, handle) = ExperimentEngine::new(config, hardware, Box::new(event_log), layout);
    let notifications = handle.subscribe();
    let engine_thread = engine.spawn_dedicated()?;

    let printer = tokio::spawn(print_progress(notifications, handle.clone(), autopilot));
    if autopilot {
        handle.send(ControlIntent::Start)?;
    } else {
        println!("Commands: start, pause, resume, next, stop");
        tokio::spawn(read_console(handle.clone()));
    }

    let result = tokio::task::spawn_blocking(move || engine_thread.join())
        .await?
        .map_err(|_| anyhow::anyhow!("experiment engine thread panicked"))?;
    printer.abort();
    camera.shutdown();

    let summary = result?;
    println!(
        "🏁 Session {}: {} of {} trials completed",
        summary.state, summary.completed, summary.total
    );
    println!("   Output: {}", summary.root.display());
    Ok(())
}

/// Forward operator commands from stdin.
async fn read_console(handle: EngineHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let intent = match line.trim().to_lowercase().as_str() {
            "start" => ControlIntent::Start,
            "pause" | "p" => ControlIntent::Pause,
            "resume" | "r" => ControlIntent::Resume,
            "next" | "n" => ControlIntent::ConfirmNext,
            "stop" | "q" => ControlIntent::Stop,
            "" => continue,
            other => {
                println!("Unknown command '{}'", other);
                continue;
            }
        };
        if let Err(e) = handle.send(intent) {
            warn!("{}", e);
            return;
        }
    }
}

async fn print_progress(
    mut notifications: tokio::sync::broadcast::Receiver<ProgressNotification>,
    handle: EngineHandle,
    autopilot: bool,
) {
    loop {
        let notification = match notifications.recv().await {
            Ok(n) => n,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Progress display lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match notification {
            ProgressNotification::StateChanged { state } => {
                println!("● {}", state);
                // A halted session only ends on Stop
                if autopilot && state == ExperimentState::Error {
                    let _ = handle.send(ControlIntent::Stop);
                }
            }
            ProgressNotification::TrialStarted {
                key,
                position,
                total,
                ..
            } => println!("▶ Trial {}/{}: {}", position, total, key),
            ProgressNotification::PhaseChanged { phase, cycle, .. } => match cycle {
                Some(c) => println!("   {} (cycle {})", phase, c),
                None => println!("   {}", phase),
            },
            ProgressNotification::RecordingSaved { path, frames } => {
                println!("   💾 {} ({} frames)", path.display(), frames)
            }
            ProgressNotification::RecordingDiscarded { path } => {
                println!("   🗑 {}", path.display())
            }
            ProgressNotification::AwaitingConfirmation { next_subject } => {
                println!("⏸ Next participant: {} (type 'next')", next_subject);
                if autopilot {
                    let _ = handle.send(ControlIntent::ConfirmNext);
                }
            }
            ProgressNotification::EstimatedEnd { at, remaining } => println!(
                "   ⏱ {:.0} s left, ends about {}",
                remaining.as_secs_f64(),
                at.format("%H:%M:%S")
            ),
            ProgressNotification::IntentRejected { intent, state } => {
                println!("   {} is not valid while {}", intent, state)
            }
            ProgressNotification::Error { message } => println!("❌ {}", message),
            _ => {}
        }
    }
}
