use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use corvus_engine::{
    AlertRepository, Consumer, EngineConfig, JsonLinesSink, JsonLinesSource,
    MemoryAlertRepository, MemoryWindowStore, NormalizedEvent, Pipeline, RuleReloader, RuleSet,
    ShutdownFlag, SqliteAlertRepository, load_and_compile,
};
use corvus_rule::{CorrelationRule, load_rule_directory, parse_rule_file, validate};

#[derive(Parser)]
#[command(name = "corvus")]
#[command(about = "Parse, validate, and run security-event correlation rules")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a single rule file and print it as JSON
    Parse {
        /// Path to a rule YAML file
        path: PathBuf,

        /// Pretty-print JSON output
        #[arg(short, long, default_value_t = true)]
        pretty: bool,
    },

    /// Load all rules in a directory (recursive) and report results
    Validate {
        /// Path to a directory containing rule YAML files
        path: PathBuf,

        /// Show each file's errors, not just the summary
        #[arg(short, long)]
        verbose: bool,
    },

    /// Evaluate events against rules
    ///
    /// Load rules from a file or directory, then evaluate JSON events.
    /// Events come from --event as a single JSON string, or as NDJSON
    /// (newline-delimited JSON) from stdin. Fired alerts print to stdout
    /// as NDJSON.
    Eval {
        /// Path to a rule file or a directory of rules
        #[arg(short, long)]
        rules: PathBuf,

        /// A single event as a JSON string (if omitted, reads NDJSON from stdin)
        #[arg(short, long)]
        event: Option<String>,

        /// Pretty-print JSON output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Run the consumer loop: NDJSON events from stdin, alerts to stdout
    Run {
        /// Path to the engine configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Parse { path, pretty } => cmd_parse(path, pretty),
        Commands::Validate { path, verbose } => cmd_validate(path, verbose),
        Commands::Eval {
            rules,
            event,
            pretty,
        } => cmd_eval(rules, event, pretty),
        Commands::Run { config } => cmd_run(config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_parse(path: PathBuf, pretty: bool) {
    match parse_rule_file(&path) {
        Ok(rule) => {
            let report = validate(&rule);
            for w in &report.warnings {
                warn!("{}: {w}", path.display());
            }
            if !report.is_valid() {
                for e in &report.errors {
                    eprintln!("{}: {e}", path.display());
                }
                process::exit(1);
            }
            print_json(&rule, pretty);
        }
        Err(e) => {
            eprintln!("Error parsing {}: {e}", path.display());
            process::exit(1);
        }
    }
}

fn cmd_validate(path: PathBuf, verbose: bool) {
    match load_rule_directory(&path) {
        Ok(outcome) => {
            println!("Loaded {} rules from {}", outcome.rules.len(), path.display());
            println!("  Rejected files: {}", outcome.errors.len());
            println!("  Warnings:       {}", outcome.warnings.len());

            if verbose {
                for err in &outcome.errors {
                    println!("  error: {}: {}", err.file, err.message);
                }
                for w in &outcome.warnings {
                    println!("  warning: {w}");
                }
            }

            if !outcome.errors.is_empty() {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn cmd_eval(rules_path: PathBuf, event: Option<String>, pretty: bool) {
    let rules = load_rules(&rules_path);
    let set = match RuleSet::compile(rules) {
        Ok(set) => set,
        Err(e) => {
            eprintln!("Error compiling rules: {e}");
            process::exit(1);
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        set,
        Arc::new(MemoryWindowStore::default()),
        Arc::new(MemoryAlertRepository::new()),
        "corvus:",
    ));

    match event {
        Some(text) => {
            let event: NormalizedEvent = match serde_json::from_str(&text) {
                Ok(ev) => ev,
                Err(e) => {
                    eprintln!("Error parsing event JSON: {e}");
                    process::exit(1);
                }
            };
            match pipeline.process_event(&event) {
                Ok(alerts) => {
                    for alert in &alerts {
                        print_json(alert, pretty);
                    }
                }
                Err(e) => {
                    eprintln!("Error evaluating event: {e}");
                    process::exit(1);
                }
            }
        }
        None => {
            let source = JsonLinesSource::new(io::stdin().lock());
            let sink = JsonLinesSink::new(io::stdout());
            let mut consumer = Consumer::new(Box::new(source), pipeline).with_sink(Box::new(sink));
            match consumer.run(&ShutdownFlag::new()) {
                Ok(stats) => info!(
                    processed = stats.processed,
                    alerts = stats.alerts,
                    malformed = stats.malformed,
                    "evaluation finished"
                ),
                Err(e) => {
                    eprintln!("Error: {e}");
                    process::exit(1);
                }
            }
        }
    }
}

fn cmd_run(config_path: PathBuf) {
    let config = match EngineConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let (rules, _) = match load_and_compile(
        &config.rules.directory,
        Some(config.store.max_window_secs),
    ) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading rules from {}: {e}", config.rules.directory.display());
            process::exit(1);
        }
    };
    info!(rules = rules.len(), dir = %config.rules.directory.display(), "rule set loaded");

    let repo: Arc<dyn AlertRepository> = match &config.alerts.database_path {
        Some(path) => match SqliteAlertRepository::open(path) {
            Ok(repo) => Arc::new(repo),
            Err(e) => {
                eprintln!("Error opening alert database {}: {e}", path.display());
                process::exit(1);
            }
        },
        None => Arc::new(MemoryAlertRepository::new()),
    };

    let pipeline = Arc::new(Pipeline::new(
        rules,
        Arc::new(MemoryWindowStore::default()),
        repo,
        config.store.key_prefix.clone(),
    ));

    let shutdown = ShutdownFlag::new();
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || shutdown.trigger()) {
            warn!(error = %e, "could not install signal handler");
        }
    }

    let reloader = RuleReloader::new(
        config.rules.directory.clone(),
        Duration::from_secs(config.rules.reload_debounce_secs),
        Some(config.store.max_window_secs),
    );

    let source = JsonLinesSource::new(io::stdin().lock());
    let sink = JsonLinesSink::new(io::stdout());
    let mut consumer = Consumer::new(Box::new(source), pipeline)
        .with_sink(Box::new(sink))
        .with_reloader(reloader)
        .with_cleanup_interval(Duration::from_secs(config.store.cleanup_interval_secs));

    match consumer.run(&shutdown) {
        Ok(stats) => info!(
            processed = stats.processed,
            alerts = stats.alerts,
            malformed = stats.malformed,
            "consumer stopped"
        ),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_rules(path: &PathBuf) -> Vec<CorrelationRule> {
    if path.is_dir() {
        match load_rule_directory(path) {
            Ok(outcome) => {
                for err in &outcome.errors {
                    warn!("{}: {}", err.file, err.message);
                }
                outcome.rules
            }
            Err(e) => {
                eprintln!("Error loading rules from {}: {e}", path.display());
                process::exit(1);
            }
        }
    } else {
        match parse_rule_file(path) {
            Ok(rule) => {
                let report = validate(&rule);
                if !report.is_valid() {
                    for e in &report.errors {
                        eprintln!("{}: {e}", path.display());
                    }
                    process::exit(1);
                }
                vec![rule]
            }
            Err(e) => {
                eprintln!("Error parsing {}: {e}", path.display());
                process::exit(1);
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) {
    let out = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match out {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Error serializing output: {e}");
            process::exit(1);
        }
    }
}
