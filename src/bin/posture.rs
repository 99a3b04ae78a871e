//! Posture CLI - Command-line interface for Posture Flux
//!
//! Commands:
//! - replay: Run recorded samples through a full session (NDJSON out)
//! - aggregate: Time-of-day buckets for one day
//! - weekly: Rolling 7-day class split
//! - config: Print the effective configuration
//! - doctor: Diagnose configuration, profile and input health

use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use posture_flux::aggregate::Aggregator;
use posture_flux::config::PostureConfig;
use posture_flux::decision::PostureProfile;
use posture_flux::pipeline::PostureSession;
use posture_flux::schema::{SampleAdapter, SCHEMA_VERSION};
use posture_flux::store::InMemoryStore;
use posture_flux::types::{DailySplit, Sample};
use posture_flux::{PostureError, POSTURE_FLUX_VERSION, PRODUCER_NAME};

/// Posture - On-device posture classification, calibration and scoring
#[derive(Parser)]
#[command(name = "posture")]
#[command(version = POSTURE_FLUX_VERSION)]
#[command(about = "Classify and score wearable posture samples", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay samples through a session and print one report per sample
    Replay {
        /// Input file path, JSON array or NDJSON (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Engine configuration JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Posture profile JSON (decision tree and thresholds)
        #[arg(long)]
        profile: Option<PathBuf>,

        /// User id the session is opened for
        #[arg(long, default_value = "cli")]
        user: String,

        /// Also print alert events
        #[arg(long)]
        events: bool,
    },

    /// Print time-of-day buckets for one day
    Aggregate {
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Calendar date (YYYY-MM-DD)
        #[arg(long)]
        date: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the rolling 7-day class split ending at `today`
    Weekly {
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Last day of the window (YYYY-MM-DD)
        #[arg(long)]
        today: String,

        /// Persisted daily history JSON ({"YYYY-MM-DD": {good, warning, bad}})
        #[arg(long)]
        history: Option<PathBuf>,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        profile: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Diagnose configuration and profile files
    Doctor {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        profile: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

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

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), PostureCliError> {
    match cli.command {
        Commands::Replay {
            input,
            config,
            profile,
            user,
            events,
        } => cmd_replay(&input, config.as_deref(), profile.as_deref(), &user, events),

        Commands::Aggregate {
            input,
            date,
            config,
        } => cmd_aggregate(&input, &date, config.as_deref()),

        Commands::Weekly {
            input,
            today,
            history,
            config,
            profile,
        } => cmd_weekly(
            &input,
            &today,
            history.as_deref(),
            config.as_deref(),
            profile.as_deref(),
        ),

        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", config.to_json()?);
            Ok(())
        }

        Commands::Doctor {
            config,
            profile,
            json,
        } => cmd_doctor(config.as_deref(), profile.as_deref(), json),
    }
}

fn cmd_replay(
    input: &Path,
    config: Option<&Path>,
    profile: Option<&Path>,
    user: &str,
    print_events: bool,
) -> Result<(), PostureCliError> {
    let config = load_config(config)?;
    let profile = load_profile(profile)?;
    let mut samples = read_samples(input)?;
    if samples.is_empty() {
        return Err(PostureCliError::NoSamples);
    }
    SampleAdapter::sort_by_timestamp(&mut samples);

    let mut session = PostureSession::open(user, Arc::new(InMemoryStore::new()), config)?;
    if let Some(profile) = profile {
        session.load_profile(profile);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for sample in samples {
        // The recording is replayed on its own clock
        let now_ms = u64::try_from(sample.timestamp).unwrap_or(0) * 1000;
        let events = session.tick(now_ms);
        if print_events {
            for event in &events {
                writeln!(out, "{}", serde_json::to_string(event)?)?;
            }
        }
        let report = session.ingest(sample, now_ms);
        writeln!(out, "{}", serde_json::to_string(&report)?)?;
    }

    writeln!(
        out,
        "{}",
        serde_json::json!({
            "score": session.score(),
            "invalid_samples": session.invalid_samples(),
        })
    )?;
    out.flush()?;
    session.teardown()?;
    Ok(())
}

fn cmd_aggregate(input: &Path, date: &str, config: Option<&Path>) -> Result<(), PostureCliError> {
    let config = load_config(config)?;
    let date = parse_date(date)?;
    let samples = read_samples(input)?;

    let aggregator = Aggregator::new(config.angle, config.features, config.utc_offset());
    let buckets = aggregator.aggregated_view(&samples, date);
    println!("{}", serde_json::to_string_pretty(&buckets)?);
    Ok(())
}

fn cmd_weekly(
    input: &Path,
    today: &str,
    history: Option<&Path>,
    config: Option<&Path>,
    profile: Option<&Path>,
) -> Result<(), PostureCliError> {
    let config = load_config(config)?;
    let profile =
        load_profile(profile)?.unwrap_or_else(|| PostureProfile::with_thresholds(config.thresholds));
    let today = parse_date(today)?;
    let samples = read_samples(input)?;
    let history: BTreeMap<String, DailySplit> = match history {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => BTreeMap::new(),
    };

    let aggregator = Aggregator::new(config.angle, config.features, config.utc_offset());
    let readings = aggregator.classify_stream(&samples, &profile);
    let summary = aggregator.weekly_summary(today, &history, &readings);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_doctor(
    config: Option<&Path>,
    profile: Option<&Path>,
    json: bool,
) -> Result<(), PostureCliError> {
    let mut checks: Vec<DoctorCheck> = vec![
        DoctorCheck {
            name: "version".to_string(),
            status: CheckStatus::Ok,
            message: format!("Posture Flux version {}", POSTURE_FLUX_VERSION),
        },
        DoctorCheck {
            name: "schema_version".to_string(),
            status: CheckStatus::Ok,
            message: format!("Input schema: {}", SCHEMA_VERSION),
        },
    ];

    checks.push(match config {
        None => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: "No config file given, using defaults".to_string(),
        },
        Some(path) => match load_config(Some(path)) {
            Ok(config) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "Config valid (thresholds {}/{}/{}, UTC offset {} min)",
                    config.thresholds.good,
                    config.thresholds.warning,
                    config.thresholds.bad,
                    config.utc_offset_minutes
                ),
            },
            Err(e) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: CliError::from(e).message,
            },
        },
    });

    if let Some(path) = profile {
        checks.push(match load_profile(Some(path)) {
            Ok(Some(profile)) if profile.has_tree() => DoctorCheck {
                name: "profile".to_string(),
                status: CheckStatus::Ok,
                message: "Profile valid with decision tree".to_string(),
            },
            Ok(_) => DoctorCheck {
                name: "profile".to_string(),
                status: CheckStatus::Warning,
                message: "Profile has no usable decision tree, thresholds will be used"
                    .to_string(),
            },
            Err(e) => DoctorCheck {
                name: "profile".to_string(),
                status: CheckStatus::Error,
                message: CliError::from(e).message,
            },
        });
    }

    checks.push(DoctorCheck {
        name: "stdin".to_string(),
        status: CheckStatus::Ok,
        message: if atty::is(atty::Stream::Stdin) {
            "stdin is a TTY (interactive mode)".to_string()
        } else {
            "stdin is a pipe (replay ready)".to_string()
        },
    });

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: POSTURE_FLUX_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Posture Doctor Report");
        println!("=====================");
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

    if report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error))
    {
        Err(PostureCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Input helpers

fn read_input(path: &Path) -> Result<String, PostureCliError> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

/// Accepts either a JSON array or NDJSON
fn read_samples(path: &Path) -> Result<Vec<Sample>, PostureCliError> {
    let content = read_input(path)?;
    let samples = if content.trim_start().starts_with('[') {
        SampleAdapter::parse_array(&content)?
    } else {
        SampleAdapter::parse_ndjson(&content)?
    };
    Ok(samples)
}

fn load_config(path: Option<&Path>) -> Result<PostureConfig, PostureCliError> {
    match path {
        Some(path) => Ok(PostureConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(PostureConfig::default()),
    }
}

fn load_profile(path: Option<&Path>) -> Result<Option<PostureProfile>, PostureCliError> {
    match path {
        Some(path) => Ok(Some(PostureProfile::from_json(&fs::read_to_string(path)?)?)),
        None => Ok(None),
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, PostureCliError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| PostureCliError::Engine(PostureError::InvalidDate(value.to_string())))
}

// Error types

#[derive(Debug)]
enum PostureCliError {
    Io(io::Error),
    Engine(PostureError),
    Json(serde_json::Error),
    NoSamples,
    DoctorFailed,
}

impl From<io::Error> for PostureCliError {
    fn from(e: io::Error) -> Self {
        PostureCliError::Io(e)
    }
}

impl From<PostureError> for PostureCliError {
    fn from(e: PostureError) -> Self {
        PostureCliError::Engine(e)
    }
}

impl From<serde_json::Error> for PostureCliError {
    fn from(e: serde_json::Error) -> Self {
        PostureCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<PostureCliError> for CliError {
    fn from(e: PostureCliError) -> Self {
        match e {
            PostureCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            PostureCliError::Engine(e) => {
                let hint = match &e {
                    PostureError::InvalidDate(_) => "Use the YYYY-MM-DD date format",
                    PostureError::InvalidThresholds(_) | PostureError::ConfigError(_) => {
                        "Run 'posture config' to see the expected layout"
                    }
                    _ => "Ensure input matches the posture.sample.v1 schema",
                };
                CliError {
                    code: "ENGINE_ERROR".to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            PostureCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            PostureCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No samples found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            PostureCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
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
