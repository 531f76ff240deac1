//! miditake - capture MIDI takes, encode them and render them to WAV.
//!
//! # Usage
//!
//! ```bash
//! miditake --list-inputs
//! miditake --record 0 --name "Morning idea" --wav
//! miditake --render take.json other.mid --patch synth
//! miditake --play output/takes/Morning_idea.json
//! ```
//!
//! Set `RUST_LOG=miditake=debug` for detailed logging on stderr.

use anyhow::{bail, Context, Result};
use miditake::audio::render::{render_batch, RenderRequest};
use miditake::audio::{Engine, NoteSink, Patch, Playback};
use miditake::capture::{list_inputs, CaptureSession};
use miditake::midi::{import_events, Take};
use miditake::storage::{store_take_json, store_take_midi, store_take_wav, DirStore};
use miditake::{Error, Settings};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Settings file read when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "miditake.json";

/// Storage key every CLI artifact is filed under.
const STORE_KEY: &str = "takes";

/// What the invocation should do.
enum Command {
    ListInputs,
    Record { device: String },
    Render { files: Vec<PathBuf> },
    Play { take: PathBuf },
}

/// Command-line options for the application.
struct CliOptions {
    command: Command,
    config: Option<PathBuf>,
    out: Option<PathBuf>,
    name: Option<String>,
    patch: Option<Patch>,
    monitor: bool,
    wav: bool,
}

fn print_help(program: &str) {
    eprintln!("miditake - MIDI take capture and rendering");
    eprintln!();
    eprintln!("Usage: {program} <COMMAND> [OPTIONS]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  --list-inputs            List MIDI input ports");
    eprintln!("  --record DEVICE          Record from a port (name or index) until Enter");
    eprintln!("  --render FILE...         Render .mid files or take .json files to WAV");
    eprintln!("  --play TAKE.json         Play a saved take through the live engine");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --name NAME              Name of the recorded take");
    eprintln!("  --patch piano|synth      Instrument patch");
    eprintln!("  --no-monitor             Do not play notes while recording");
    eprintln!("  --wav                    Also render a recorded take to WAV");
    eprintln!("  --config PATH            Settings file (default: {DEFAULT_CONFIG_PATH})");
    eprintln!("  --out DIR                Output directory (overrides settings)");
    eprintln!("  -h, --help               Print this help message");
}

impl CliOptions {
    /// Parses command-line arguments.
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let program = args.first().map(String::as_str).unwrap_or("miditake");

        let mut command = None;
        let mut config = None;
        let mut out = None;
        let mut name = None;
        let mut patch = None;
        let mut monitor = true;
        let mut wav = false;

        let mut i = 1;
        let value = |i: usize, flag: &str| -> Result<String> {
            args.get(i)
                .cloned()
                .with_context(|| format!("{flag} requires an argument"))
        };

        while i < args.len() {
            match args[i].as_str() {
                "--list-inputs" => command = Some(Command::ListInputs),
                "--record" => {
                    i += 1;
                    command = Some(Command::Record {
                        device: value(i, "--record")?,
                    });
                }
                "--render" => {
                    let mut files = Vec::new();
                    while i + 1 < args.len() && !args[i + 1].starts_with("--") {
                        i += 1;
                        files.push(PathBuf::from(&args[i]));
                    }
                    if files.is_empty() {
                        bail!("--render requires at least one file");
                    }
                    command = Some(Command::Render { files });
                }
                "--play" => {
                    i += 1;
                    command = Some(Command::Play {
                        take: PathBuf::from(value(i, "--play")?),
                    });
                }
                "--name" => {
                    i += 1;
                    name = Some(value(i, "--name")?);
                }
                "--patch" => {
                    i += 1;
                    let raw = value(i, "--patch")?;
                    patch = Some(raw.parse::<Patch>().map_err(anyhow::Error::msg)?);
                }
                "--config" => {
                    i += 1;
                    config = Some(PathBuf::from(value(i, "--config")?));
                }
                "--out" => {
                    i += 1;
                    out = Some(PathBuf::from(value(i, "--out")?));
                }
                "--no-monitor" => monitor = false,
                "--wav" => wav = true,
                "--help" | "-h" => {
                    print_help(program);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        let Some(command) = command else {
            print_help(program);
            std::process::exit(1);
        };

        Ok(Self {
            command,
            config,
            out,
            name,
            patch,
            monitor,
            wav,
        })
    }
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut settings = Settings::load(&config_path)
        .with_context(|| format!("Failed to load settings: {}", config_path.display()))?;
    if let Some(out) = &cli.out {
        settings.output_dir = out.clone();
    }
    if let Some(patch) = cli.patch {
        settings.patch = patch;
    }

    match &cli.command {
        Command::ListInputs => run_list_inputs(),
        Command::Record { device } => run_record(&cli, &settings, device),
        Command::Render { files } => run_render(&settings, files),
        Command::Play { take } => run_play(take),
    }
}

fn run_list_inputs() -> Result<()> {
    let inputs = list_inputs().context("Failed to query MIDI inputs")?;
    if inputs.is_empty() {
        eprintln!("No MIDI input ports found.");
    }
    for input in inputs {
        println!("{}: {}", input.index, input.name);
    }
    Ok(())
}

/// Signals once the user presses Enter (or stdin closes).
fn spawn_enter_listener() -> crossbeam_channel::Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
        let _ = tx.send(());
    });
    rx
}

fn run_record(cli: &CliOptions, settings: &Settings, device: &str) -> Result<()> {
    let name = cli.name.clone().unwrap_or_else(|| "take".to_string());

    // Monitoring is a convenience; a missing output device must not block recording
    let engine = if cli.monitor {
        match Engine::new(settings.patch) {
            Ok(engine) => Some(engine),
            Err(e) => {
                tracing::warn!(error = %e, "recording without monitoring");
                None
            }
        }
    } else {
        None
    };
    let monitor = engine
        .as_ref()
        .map(|engine| Arc::new(engine.handle()) as Arc<dyn NoteSink>);

    let session = CaptureSession::start(
        device,
        &name,
        settings.patch,
        monitor,
        Duration::from_millis(settings.device_poll_ms),
    )
    .context("Failed to start capture")?;

    eprintln!("Recording '{name}' with {}. Press Enter to stop.", settings.patch);
    let enter = spawn_enter_listener();
    while !session.is_device_lost() {
        if enter.recv_timeout(Duration::from_millis(50)).is_ok() {
            break;
        }
    }

    let take = session.stop();
    if let Some(engine) = engine {
        engine.dispose();
    }
    if take.interrupted {
        eprintln!("Input device was lost; keeping the partial take.");
    }
    let finished = take.terminated_events().count();
    eprintln!("Captured {finished} notes ({} still held at stop).", take.len() - finished);

    let store = DirStore::new(&settings.output_dir);
    let midi = store_take_midi(&store, STORE_KEY, &take, &settings.smf_options())
        .context("Failed to store MIDI file")?;
    println!("{}", midi.location);
    let json = store_take_json(&store, STORE_KEY, &take).context("Failed to store take")?;
    println!("{}", json.location);

    if cli.wav {
        match miditake::render(take.events(), take.patch, &settings.render_options()) {
            Ok(audio) => {
                let wav = store_take_wav(&store, STORE_KEY, &take, &audio)
                    .context("Failed to store WAV file")?;
                println!("{}", wav.location);
            }
            Err(Error::NoRenderableNotes) => {
                eprintln!("Nothing to render: the take has no finished notes.")
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to render take")),
        }
    }

    Ok(())
}

/// Loads a render source: a saved take, or any Standard MIDI File.
fn load_source(path: &Path, patch: Patch) -> Result<Take> {
    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
        let mut take = Take::load_from_file(path)
            .with_context(|| format!("Failed to load take: {}", path.display()))?;
        take.patch = patch;
        return Ok(take);
    }

    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let events =
        import_events(&bytes).with_context(|| format!("Failed to parse {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Take::from_events(&name, patch, events))
}

fn run_render(settings: &Settings, files: &[PathBuf]) -> Result<()> {
    let takes = files
        .iter()
        .map(|path| load_source(path, settings.patch))
        .collect::<Result<Vec<_>>>()?;

    let requests: Vec<RenderRequest> = takes
        .iter()
        .map(|take| RenderRequest {
            events: take.events().to_vec(),
            patch: take.patch,
            options: settings.render_options(),
        })
        .collect();

    let store = DirStore::new(&settings.output_dir);
    let mut failed = 0;
    for ((take, path), result) in takes.iter().zip(files).zip(render_batch(&requests)) {
        let stored = result.and_then(|audio| {
            store_take_wav(&store, STORE_KEY, take, &audio)
                .map(|stored| (stored, audio.duration_seconds()))
        });
        match stored {
            Ok((stored, seconds)) => println!("{} ({seconds:.1} s)", stored.location),
            Err(e) => {
                failed += 1;
                eprintln!("{}: {e}", path.display());
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} renders failed", files.len());
    }
    Ok(())
}

fn run_play(path: &Path) -> Result<()> {
    let take = Take::load_from_file(path)
        .with_context(|| format!("Failed to load take: {}", path.display()))?;
    let engine = Engine::new(take.patch).context("Failed to open audio output")?;

    let stop_rx = spawn_enter_listener();

    eprintln!("Playing '{}'. Press Enter to stop.", take.name);
    let playback = Playback::start(take.events(), Arc::new(engine.handle()));
    while !playback.is_finished() {
        if stop_rx.recv_timeout(Duration::from_millis(50)).is_ok() {
            break;
        }
    }

    if playback.is_finished() {
        // Let the last release ring out
        let tail = take.patch.params().release_seconds();
        std::thread::sleep(Duration::from_secs_f32(tail));
    }
    playback.stop();
    engine.dispose();
    Ok(())
}
