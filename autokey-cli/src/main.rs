//! # autokey - realtime key and scale detection
//!
//! Console host for `autokey-core`. Listens to a microphone, an instrument
//! input or the system output, prints each new key as it is detected and
//! forwards it to a pitch-correction plugin over MIDI.
//!
//! ## Architecture
//! - **Main Thread**: argument parsing, then the stdin command loop
//! - **Capture / Analysis Threads**: owned by the core `KeyDetector`
//! - **MIDI Thread**: owns the output port; fed over a crossbeam channel

mod midi_out;

use anyhow::{Context, Result};
use autokey_core::capture::{
    level_bar, list_input_devices, list_output_devices, measure_level, CaptureRequest, CpalBackend,
    DeviceInfo, LevelVerdict,
};
use autokey_core::config::{load_config, save_config};
use autokey_core::{
    CaptureMode, DetectorConfig, DetectorError, DeviceSelector, EstimatorKind, KeyDetector,
    KeyScale,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use midi_out::{MidiCommand, MidiHandle, MidiWorker};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "autokey", version, about = "Realtime musical key and scale detection")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides this.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List audio capture devices and MIDI output ports
    Devices {
        /// Record from this device (index or name) and report its level
        #[arg(long, value_name = "DEVICE")]
        test: Option<String>,

        /// With --test, treat DEVICE as an output to capture by loopback
        #[arg(long, requires = "test")]
        loopback: bool,

        /// Seconds to record with --test
        #[arg(long, value_name = "SECS", default_value_t = 3, requires = "test")]
        seconds: u64,
    },
    /// Detect keys until `q` is entered
    Run {
        #[command(flatten)]
        detector: DetectorArgs,

        /// Connect to the first MIDI output port containing this text
        #[arg(long, value_name = "NAME", default_value = "loopMIDI")]
        midi_port: String,

        /// Do not send MIDI at all
        #[arg(long)]
        no_midi: bool,
    },
    /// Write the effective configuration as JSON
    Config {
        #[command(flatten)]
        detector: DetectorArgs,

        #[arg(long, value_name = "PATH")]
        write: PathBuf,
    },
}

#[derive(Args)]
struct DetectorArgs {
    /// Device index (from `autokey devices`) or exact device name
    #[arg(short, long, value_name = "DEVICE")]
    device: Option<String>,

    /// Capture the system output instead of an input device
    #[arg(long)]
    loopback: bool,

    #[arg(short, long, value_enum)]
    estimator: Option<EstimatorArg>,

    /// Load settings from a JSON file before applying the flags above
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EstimatorArg {
    /// About a second of audio per estimate; steadier
    Batched,
    /// One estimate per block; faster to react
    LowLatency,
}

impl From<EstimatorArg> for EstimatorKind {
    fn from(arg: EstimatorArg) -> Self {
        match arg {
            EstimatorArg::Batched => EstimatorKind::Batched,
            EstimatorArg::LowLatency => EstimatorKind::LowLatency,
        }
    }
}

impl DetectorArgs {
    fn resolve(&self) -> Result<DetectorConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => DetectorConfig::default(),
        };
        if let Some(device) = &self.device {
            config.device = DeviceSelector::parse(device);
        }
        if self.loopback {
            config.mode = CaptureMode::Loopback;
        }
        if let Some(estimator) = self.estimator {
            config.estimator = estimator.into();
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Devices {
            test: None, ..
        } => print_devices(),
        Commands::Devices {
            test: Some(device),
            loopback,
            seconds,
        } => test_device(&device, loopback, Duration::from_secs(seconds)),
        Commands::Run {
            detector,
            midi_port,
            no_midi,
        } => run(detector.resolve()?, (!no_midi).then_some(midi_port)),
        Commands::Config { detector, write } => {
            let config = detector.resolve()?;
            save_config(&config, &write)
                .with_context(|| format!("Failed to write {}", write.display()))?;
            println!("Configuration written to {}", write.display());
            Ok(())
        }
    }
}

fn print_device(info: &DeviceInfo, tag_loopback: bool) {
    let rate = info
        .default_sample_rate
        .map_or_else(|| "?".to_string(), |r| format!("{r} Hz"));
    let mut notes = Vec::new();
    if info.is_default {
        notes.push("default");
    }
    if tag_loopback && info.looks_like_loopback() {
        notes.push("loopback");
    }
    let notes = if notes.is_empty() {
        String::new()
    } else {
        format!(" [{}]", notes.join(", "))
    };
    println!(
        "  {:>2}: {} ({} ch, {}){}",
        info.index, info.name, info.channels, rate, notes
    );
}

fn print_devices() -> Result<()> {
    println!("Input devices:");
    for info in list_input_devices()? {
        print_device(&info, true);
    }
    println!("Output devices (usable with --loopback):");
    for info in list_output_devices()? {
        print_device(&info, false);
    }
    match midi_out::list_output_ports() {
        Ok(ports) => {
            println!("MIDI output ports:");
            for port in ports {
                println!("  {port}");
            }
        }
        Err(e) => warn!("Could not list MIDI ports: {e:#}"),
    }
    Ok(())
}

fn test_device(device: &str, loopback: bool, duration: Duration) -> Result<()> {
    let mut config = DetectorConfig {
        device: DeviceSelector::parse(device),
        ..Default::default()
    };
    if loopback {
        config.mode = CaptureMode::Loopback;
    }
    let request = CaptureRequest::from_config(&config, config.target_sample_rate);
    println!("Testing {} for {} s. Make some noise!", request.device, duration.as_secs());

    let report = measure_level(&CpalBackend, &request, duration, |level| {
        print!("\rLevel: {:<50} {level:.4}", level_bar(level));
        let _ = io::stdout().flush();
    })
    .with_context(|| format!("Level check on {device} failed"))?;

    println!();
    println!("Frames: {} at {} Hz", report.frames, report.sample_rate);
    println!("Average level: {:.4}", report.average);
    println!("Peak level: {:.4}", report.peak);
    println!("{}", verdict_advice(report.verdict()));
    Ok(())
}

fn verdict_advice(verdict: LevelVerdict) -> &'static str {
    match verdict {
        LevelVerdict::Silent => {
            "WARNING: very low level. Check the device is connected, not muted and its input gain is up."
        }
        LevelVerdict::Low => "Level is low. Consider raising the input gain.",
        LevelVerdict::Good => "Level looks good.",
    }
}

fn announce(midi: &Option<MidiHandle>, command: MidiCommand) {
    if let Some(midi) = midi {
        midi.send(command);
    }
}

fn run(config: DetectorConfig, midi_port: Option<String>) -> Result<()> {
    let midi = match midi_port {
        Some(port) => match MidiWorker::spawn(port) {
            Ok(worker) => Some(worker),
            Err(e) => {
                warn!("MIDI output disabled: {e:#}");
                None
            }
        },
        None => None,
    };
    let midi_handle = midi.as_ref().map(MidiWorker::handle);

    let on_key = midi_handle.clone();
    let on_fault = midi_handle.clone();
    let mut detector = KeyDetector::new(config, move |key: &KeyScale| {
        println!(">>> {key}");
        announce(&on_key, MidiCommand::Key(*key));
    })
    .on_error(move |e: &DetectorError| {
        error!("{e}");
        println!("Detection stopped: {e}. Enter 's' to start again.");
        announce(&on_fault, MidiCommand::DetectionActive(false));
    });

    start(&mut detector, &midi_handle);
    print_commands();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        match line?.trim() {
            "" => {}
            "r" => {
                let config = detector.config().clone();
                announce(&midi_handle, MidiCommand::DetectionActive(false));
                match detector.restart_with(config.device, config.mode) {
                    Ok(()) => announce(&midi_handle, MidiCommand::DetectionActive(true)),
                    Err(e) => error!("Restart failed: {e}"),
                }
            }
            "s" => {
                if detector.is_running() {
                    detector.stop();
                    announce(&midi_handle, MidiCommand::DetectionActive(false));
                } else {
                    start(&mut detector, &midi_handle);
                }
            }
            "q" => break,
            other => {
                println!("Unknown command '{other}'");
                print_commands();
            }
        }
    }

    info!("Shutting down...");
    detector.stop();
    announce(&midi_handle, MidiCommand::DetectionActive(false));
    drop(detector);
    if let Some(midi) = midi {
        midi.shutdown();
    }
    Ok(())
}

fn start(detector: &mut KeyDetector, midi: &Option<MidiHandle>) {
    match detector.start() {
        Ok(()) => announce(midi, MidiCommand::DetectionActive(true)),
        Err(e) => error!("Could not start detection: {e}"),
    }
}

fn print_commands() {
    println!("Commands: r = restart, s = start/stop, q = quit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_lists_by_default() {
        let cli = Cli::try_parse_from(["autokey", "devices"]).unwrap();
        assert!(matches!(cli.command, Commands::Devices { test: None, .. }));
    }

    #[test]
    fn devices_test_takes_a_device_and_duration() {
        let cli =
            Cli::try_parse_from(["autokey", "devices", "--test", "2", "--seconds", "5"]).unwrap();
        match cli.command {
            Commands::Devices { test, loopback, seconds } => {
                assert_eq!(test.as_deref(), Some("2"));
                assert!(!loopback);
                assert_eq!(seconds, 5);
            }
            _ => panic!("expected devices"),
        }
    }

    #[test]
    fn loopback_flag_needs_a_device_to_test() {
        assert!(Cli::try_parse_from(["autokey", "devices", "--loopback"]).is_err());
    }

    #[test]
    fn advice_follows_the_verdict() {
        assert!(verdict_advice(LevelVerdict::Silent).starts_with("WARNING"));
        assert!(verdict_advice(LevelVerdict::Good).contains("good"));
    }
}
