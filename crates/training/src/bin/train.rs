use std::{
    path::PathBuf,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use serde_json::{Map, Number, Value};
use training::{distributed::Backend, session, TrainingConfig, TrainingError};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Data-parallel classifier training", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (.toml or .json)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "DIR", help = "Resume from a checkpoint directory")]
    resume: Option<PathBuf>,

    #[arg(short, long, help = "Evaluate the model on the validation set and exit")]
    evaluate: bool,

    #[arg(long, help = "Total number of ranks")]
    world_size: Option<usize>,

    #[arg(long, help = "Rank of this process")]
    rank: Option<usize>,

    #[arg(long, value_name = "URL", help = "tcp://HOST:PORT or env://")]
    dist_url: Option<String>,

    #[arg(long, value_name = "BACKEND", help = "local, in_process or tcp")]
    dist_backend: Option<Backend>,

    #[arg(long, help = "Run all ranks as threads of this process")]
    spawn: bool,

    #[arg(long, help = "Seed for initialization and shuffling")]
    seed: Option<u64>,

    #[arg(long, value_name = "DEVICE", help = "auto, cpu, cuda[:N] or metal[:N]")]
    device: Option<String>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    apply_flags(&mut config, &args);
    config.validate()?;

    ctrlc::set_handler(|| {
        if STOP_REQUESTED.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        eprintln!("stop requested; finishing the current epoch (press again to abort)");
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let outcomes = session::run(&config, &|| STOP_REQUESTED.load(Ordering::Relaxed))?;
    for outcome in outcomes.iter().filter(|outcome| outcome.rank == 0) {
        match &outcome.last_evaluation {
            Some(summary) => println!(
                "finished {} epoch(s) from epoch {}: best acc {:.3}, last acc {:.3} over {} samples",
                outcome.epochs_completed,
                outcome.start_epoch,
                outcome.best_metric,
                summary.primary_accuracy(),
                summary.samples
            ),
            None => println!("no epochs run (start epoch {})", outcome.start_epoch),
        }
    }

    Ok(())
}

fn apply_flags(config: &mut TrainingConfig, args: &Args) {
    if let Some(resume) = &args.resume {
        config.runtime.resume = Some(resume.clone());
    }
    if args.evaluate {
        config.runtime.evaluate_only = true;
    }
    if let Some(seed) = args.seed {
        config.runtime.seed = Some(seed);
    }
    if let Some(device) = &args.device {
        config.runtime.device = device.clone();
    }
    if let Some(world_size) = args.world_size {
        config.distributed.world_size = Some(world_size);
    }
    if let Some(rank) = args.rank {
        config.distributed.rank = Some(rank);
    }
    if let Some(url) = &args.dist_url {
        config.distributed.init_method = url.clone();
    }
    if let Some(backend) = args.dist_backend {
        config.distributed.backend = backend;
    }
    if args.spawn {
        config.distributed.spawn = true;
        config.distributed.backend = Backend::InProcess;
    }
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Assigns `new_value` at a dot-separated path, creating intermediate tables.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{path}'"
        )));
    }

    let mut current = value;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::ConfigFormat(format!(
                "override path '{path}' descends into non-table value at '{segment}'"
            ))
        })?;
        if idx + 1 == segments.len() {
            map.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(())
}
