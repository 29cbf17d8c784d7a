//! Link CLI - Command-line interface for Synheart Link
//!
//! Commands:
//! - decode: Replay a captured byte stream through the decoder (NDJSON output)
//! - pair: Save the band's address for the next connection
//! - history: Print the persisted sample history
//! - latest: Print the most recent sample
//! - doctor: Diagnose store and configuration health
//! - run: Keep a band connected until Ctrl-C (requires the `btleplug` feature)

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use synheart_link::decoder::FrameDecoder;
use synheart_link::error::{ConfigError, IdentityError, ServiceError, StoreError, TransportError};
use synheart_link::history::history_json;
use synheart_link::interpreter::RecordInterpreter;
use synheart_link::storage::{keys, FileStore, KeyValueStore};
use synheart_link::types::{BridgeEvent, DeviceIdentity, HealthSample, Record};
use synheart_link::{LinkConfig, LINK_VERSION, PRODUCER_NAME};

/// Link - Background BLE link for Synheart wearable bands
#[derive(Parser)]
#[command(name = "link")]
#[command(author = "Synheart AI Inc")]
#[command(version = LINK_VERSION)]
#[command(about = "Connect to a Synheart band and decode its health stream", long_about = None)]
struct Cli {
    /// Durable state file
    #[arg(long, global = true, default_value = "link_state.json")]
    store: PathBuf,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a captured byte stream through the decoder
    Decode {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Bytes per simulated notification
        #[arg(long, default_value = "20")]
        chunk_size: usize,
    },

    /// Save the band's address for the next connection
    Pair {
        /// Transport address, e.g. AA:BB:CC:DD:EE:FF
        address: String,
    },

    /// Print the persisted sample history
    History {
        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,
    },

    /// Print the most recent sample
    Latest,

    /// Diagnose store and configuration health
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep the saved band connected until Ctrl-C, printing events as NDJSON
    #[cfg(feature = "btleplug")]
    Run {
        /// Build number used for stale-instance detection
        #[arg(long, default_value = "1")]
        version_code: i64,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one sample per line)
    Ndjson,
    /// JSON array of samples
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .try_init();
}

fn run(cli: Cli) -> Result<(), LinkCliError> {
    match cli.command {
        Commands::Decode { input, chunk_size } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_decode(&input, chunk_size, &config)
        }
        Commands::Pair { address } => cmd_pair(&cli.store, &address),
        Commands::History { output_format } => cmd_history(&cli.store, &output_format),
        Commands::Latest => cmd_latest(&cli.store),
        Commands::Doctor { json } => cmd_doctor(&cli.store, cli.config.as_deref(), json),
        #[cfg(feature = "btleplug")]
        Commands::Run { version_code } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_run(&cli.store, &config, version_code)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<LinkConfig, LinkCliError> {
    match path {
        Some(path) => Ok(LinkConfig::load(path)?),
        None => Ok(LinkConfig::default()),
    }
}

fn cmd_decode(input: &Path, chunk_size: usize, config: &LinkConfig) -> Result<(), LinkCliError> {
    let data = if input.to_string_lossy() == "-" {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer)?;
        buffer
    } else {
        fs::read(input)?
    };

    let mut decoder = FrameDecoder::new(config.decoder.buffer_cap);
    let interpreter = RecordInterpreter::default()
        .with_cycle_minutes(config.interpreter.pending_cycle_minutes)
        .with_reminder_message(config.interpreter.wear_reminder_message.clone());

    let mut stdout = io::stdout().lock();
    let mut frames = 0usize;
    let mut samples = 0usize;
    let mut reminders = 0usize;

    for chunk in data.chunks(chunk_size.max(1)) {
        for frame in decoder.feed(chunk) {
            frames += 1;
            let event = match interpreter.interpret(&frame) {
                Some(Record::Sample(sample)) => {
                    samples += 1;
                    BridgeEvent::HealthDataReceived(sample)
                }
                Some(Record::WearReminder) => {
                    reminders += 1;
                    BridgeEvent::NotificationReceived {
                        message: config.interpreter.wear_reminder_message.clone(),
                    }
                }
                None => continue,
            };
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
        }
    }
    stdout.flush()?;

    info!(
        bytes = data.len(),
        frames,
        samples,
        reminders,
        discarded = frames - samples - reminders,
        overflows = decoder.overflow_count(),
        "decode finished"
    );
    Ok(())
}

fn cmd_pair(store_path: &Path, address: &str) -> Result<(), LinkCliError> {
    let identity = DeviceIdentity::new(address)?;
    let store = FileStore::open(store_path)?;
    store.put(
        keys::LAST_DEVICE_ADDRESS,
        serde_json::Value::from(identity.as_str()),
    )?;
    info!(address = %identity, store = %store_path.display(), "device paired");
    Ok(())
}

fn cmd_history(store_path: &Path, format: &OutputFormat) -> Result<(), LinkCliError> {
    let store = FileStore::open(store_path)?;
    let samples: Vec<HealthSample> = serde_json::from_str(&history_json(&store)?)?;
    print!("{}", format_output(&samples, format)?);
    Ok(())
}

fn cmd_latest(store_path: &Path) -> Result<(), LinkCliError> {
    let store = FileStore::open(store_path)?;
    let latest = match store.get(keys::LAST_HEALTH_DATA)? {
        None | Some(serde_json::Value::Null) => return Err(LinkCliError::NoSamples),
        Some(value) => serde_json::from_value::<HealthSample>(value)?,
    };
    println!("{}", serde_json::to_string_pretty(&latest)?);
    Ok(())
}

fn cmd_doctor(store_path: &Path, config: Option<&Path>, json: bool) -> Result<(), LinkCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "link_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Link version {}", LINK_VERSION),
    });

    checks.push(match config {
        None => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: "No config file, using defaults".to_string(),
        },
        Some(path) => match LinkConfig::load(path) {
            Ok(config) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "Config valid (characteristic {}, reconnect every {}s)",
                    config.link.characteristic_uuid, config.link.reconnect_delay_secs
                ),
            },
            Err(e) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            },
        },
    });

    if store_path.exists() {
        match FileStore::open(store_path) {
            Ok(store) => checks.extend(store_checks(&store)),
            Err(e) => checks.push(DoctorCheck {
                name: "store".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot read store: {}", e),
            }),
        }
    } else {
        checks.push(DoctorCheck {
            name: "store".to_string(),
            status: CheckStatus::Warning,
            message: "Store file does not exist yet".to_string(),
        });
    }

    checks.push(if cfg!(feature = "btleplug") {
        DoctorCheck {
            name: "transport".to_string(),
            status: CheckStatus::Ok,
            message: "btleplug backend available".to_string(),
        }
    } else {
        DoctorCheck {
            name: "transport".to_string(),
            status: CheckStatus::Warning,
            message: "Built without btleplug, 'link run' unavailable".to_string(),
        }
    });

    // Check stdin is available (for decode from a pipe)
    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (decode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: LINK_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Link Doctor Report");
        println!("==================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(LinkCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn store_checks(store: &FileStore) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    checks.push(match store.get_string(keys::LAST_DEVICE_ADDRESS) {
        Ok(Some(address)) => DoctorCheck {
            name: "paired_device".to_string(),
            status: CheckStatus::Ok,
            message: format!("Paired with {}", address),
        },
        Ok(None) => DoctorCheck {
            name: "paired_device".to_string(),
            status: CheckStatus::Warning,
            message: "No device paired, run 'link pair <address>'".to_string(),
        },
        Err(e) => DoctorCheck {
            name: "paired_device".to_string(),
            status: CheckStatus::Error,
            message: e.to_string(),
        },
    });

    checks.push(
        match history_json(store)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                serde_json::from_str::<Vec<HealthSample>>(&json).map_err(|e| e.to_string())
            }) {
            Ok(samples) => DoctorCheck {
                name: "history".to_string(),
                status: CheckStatus::Ok,
                message: format!("{} samples stored", samples.len()),
            },
            Err(e) => DoctorCheck {
                name: "history".to_string(),
                status: CheckStatus::Error,
                message: format!("Invalid history: {}", e),
            },
        },
    );

    if let Ok(Some(true)) = store.get_bool(keys::SERVICE_RUNNING) {
        checks.push(DoctorCheck {
            name: "service".to_string(),
            status: CheckStatus::Ok,
            message: "Service marked running".to_string(),
        });
    }

    checks
}

#[cfg(feature = "btleplug")]
fn cmd_run(store_path: &Path, config: &LinkConfig, version_code: i64) -> Result<(), LinkCliError> {
    use std::sync::Arc;
    use synheart_link::btleplug_backend::{BtleplugConfig, BtleplugTransport};
    use synheart_link::platform::LogPlatform;
    use synheart_link::{
        Bridge, BroadcastSink, ChannelSink, ConnectionManager, HealthService, LinkDeps,
        StartOutcome,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (transport, events) = BtleplugTransport::new(BtleplugConfig {
            service_uuid: config.link.service_uuid,
            ..BtleplugConfig::default()
        })
        .await?;

        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(store_path)?);
        let bridge = Arc::new(Bridge::with_broadcast(Arc::new(BroadcastSink::new(64))));
        let (ui, mut ui_events) = ChannelSink::new();
        bridge.attach_ui(Arc::new(ui));

        let deps = LinkDeps::new(
            Arc::new(transport),
            store.clone(),
            bridge,
            Arc::new(LogPlatform),
        );
        let manager = ConnectionManager::new(config, deps);
        let pump = tokio::spawn(manager.clone().run_events(events));
        let service = HealthService::new(manager, store, Arc::new(LogPlatform));

        if let StartOutcome::Stale { saved, current } = service.start(version_code)? {
            pump.abort();
            return Err(LinkCliError::StaleBuild { saved, current });
        }

        let mut stdout = io::stdout();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                Some(event) = ui_events.recv() => {
                    writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
                    stdout.flush()?;
                }
            }
        }

        service.stop()?;
        pump.abort();
        Ok::<(), LinkCliError>(())
    })
}

// Helper functions

fn format_output(samples: &[HealthSample], format: &OutputFormat) -> Result<String, LinkCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut out = String::new();
            for sample in samples {
                out.push_str(&serde_json::to_string(sample)?);
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Json => Ok(serde_json::to_string(samples)? + "\n"),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(samples)? + "\n"),
    }
}

// Error types

#[derive(Debug)]
enum LinkCliError {
    Io(io::Error),
    Json(serde_json::Error),
    Store(StoreError),
    Config(ConfigError),
    Identity(IdentityError),
    Service(ServiceError),
    Transport(TransportError),
    NoSamples,
    DoctorFailed,
    #[cfg_attr(not(feature = "btleplug"), allow(dead_code))]
    StaleBuild { saved: i64, current: i64 },
}

impl From<io::Error> for LinkCliError {
    fn from(e: io::Error) -> Self {
        LinkCliError::Io(e)
    }
}

impl From<serde_json::Error> for LinkCliError {
    fn from(e: serde_json::Error) -> Self {
        LinkCliError::Json(e)
    }
}

impl From<StoreError> for LinkCliError {
    fn from(e: StoreError) -> Self {
        LinkCliError::Store(e)
    }
}

impl From<ConfigError> for LinkCliError {
    fn from(e: ConfigError) -> Self {
        LinkCliError::Config(e)
    }
}

impl From<IdentityError> for LinkCliError {
    fn from(e: IdentityError) -> Self {
        LinkCliError::Identity(e)
    }
}

impl From<ServiceError> for LinkCliError {
    fn from(e: ServiceError) -> Self {
        LinkCliError::Service(e)
    }
}

impl From<TransportError> for LinkCliError {
    fn from(e: TransportError) -> Self {
        LinkCliError::Transport(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<LinkCliError> for CliError {
    fn from(e: LinkCliError) -> Self {
        match e {
            LinkCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            LinkCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("The store may be corrupt; run 'link doctor'".to_string()),
            },
            LinkCliError::Store(e) => CliError {
                code: "STORE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'link doctor' to inspect the store".to_string()),
            },
            LinkCliError::Config(e) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Fix the config file or omit --config to use defaults".to_string()),
            },
            LinkCliError::Identity(e) => CliError {
                code: "SAVE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Pass the band's address, e.g. AA:BB:CC:DD:EE:FF".to_string()),
            },
            LinkCliError::Service(e) => CliError {
                code: "SERVICE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            LinkCliError::Transport(e) => CliError {
                code: "TRANSPORT_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check that Bluetooth is on and the band is nearby".to_string()),
            },
            LinkCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No samples stored yet".to_string(),
                hint: Some("Run 'link run' with a paired band first".to_string()),
            },
            LinkCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            LinkCliError::StaleBuild { saved, current } => CliError {
                code: "STALE_BUILD".to_string(),
                message: format!(
                    "Store was last used by build {}, this is build {}",
                    saved, current
                ),
                hint: Some("Run again to start with the current build".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
