//! Unit state command-line tool.
//!
//! Provides the `unitdata` binary so shell-based hooks can read and write the
//! same unit state the library API uses. Without `--db` the database location
//! follows the store's environment policy (`UNIT_STATE_DB`, `CHARM_DIR`, ...).
//!
//! Values are printed as JSON on stdout; logs go to stderr.

use std::io;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde_json::Value;

use unitdata_storage::{ProcessEnv, Storage, StoreConfig, StorePath};

/// Read and write persistent unit state.
#[derive(Parser)]
#[command(name = "unitdata", about = "Read and write persistent unit state")]
struct Cli {
    /// Path to the unit state database (default: derived from the environment).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print the value stored under a key.
    Get {
        /// Key to retrieve.
        key: String,
    },

    /// Print every key starting with a prefix.
    Getrange {
        /// Prefix of the keys to retrieve.
        prefix: String,

        /// Remove the prefix from the printed keys.
        #[arg(long)]
        strip: bool,
    },

    /// Store a value under a key.
    Set {
        /// Key to set.
        key: String,

        /// Value to store.
        value: String,

        /// Parse the value as JSON instead of storing it as a string.
        #[arg(long)]
        json: bool,
    },

    /// Remove a key.
    Unset {
        /// Key to remove.
        key: String,
    },

    /// Print the recorded history of a key.
    History {
        /// Key whose history to print.
        key: String,

        /// Decode stored values instead of printing them as stored.
        #[arg(long)]
        deserialize: bool,
    },

    /// Dump the live and history tables.
    Debug,
}

fn main() {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = Cli::parse();
    let exit_code = run(cli.db, cli.command);
    process::exit(exit_code);
}

/// Opens the store and dispatches one command.
///
/// `--db` overrides only the location; the busy timeout still comes from the
/// environment.
///
/// Returns exit code: 0 = success, 1 = bad value, 2 = storage error,
/// 3 = database could not be opened.
fn run(db: Option<PathBuf>, command: Commands) -> i32 {
    let opened = StoreConfig::resolve(&ProcessEnv).and_then(|config| match db {
        Some(path) => Storage::open(StoreConfig {
            path: StorePath::File(path),
            ..config
        }),
        None => Storage::open(config),
    });
    let mut store = match opened {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: failed to open unit state: {}", e);
            return 3;
        }
    };

    let exit_code = match command {
        Commands::Get { key } => run_get(&store, &key),
        Commands::Getrange { prefix, strip } => run_getrange(&store, &prefix, strip),
        Commands::Set { key, value, json } => run_set(&mut store, &key, &value, json),
        Commands::Unset { key } => run_unset(&mut store, &key),
        Commands::History { key, deserialize } => run_history(&store, &key, deserialize),
        Commands::Debug => run_debug(&store),
    };

    if let Err(e) = store.close() {
        eprintln!("Error: failed to close unit state: {}", e);
        return 2;
    }
    exit_code
}

fn run_get(store: &Storage, key: &str) -> i32 {
    match store.get(key) {
        Ok(value) => print_json(&value.unwrap_or(Value::Null)),
        Err(e) => storage_error(e),
    }
}

fn run_getrange(store: &Storage, prefix: &str, strip: bool) -> i32 {
    match store.getrange(prefix, strip) {
        Ok(Some(range)) => print_json(&Value::Object(range)),
        Ok(None) => print_json(&Value::Null),
        Err(e) => storage_error(e),
    }
}

fn run_set(store: &mut Storage, key: &str, raw: &str, json: bool) -> i32 {
    let value = match parse_value(raw, json) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return 1;
        }
    };
    match store.set(key, value).and_then(|_| store.flush(true)) {
        Ok(()) => 0,
        Err(e) => storage_error(e),
    }
}

fn run_unset(store: &mut Storage, key: &str) -> i32 {
    match store.unset(key).and_then(|_| store.flush(true)) {
        Ok(()) => 0,
        Err(e) => storage_error(e),
    }
}

fn run_history(store: &Storage, key: &str, deserialize: bool) -> i32 {
    match store.gethistory(key, deserialize) {
        Ok(history) => match serde_json::to_value(&history) {
            Ok(value) => print_json(&value),
            Err(e) => {
                eprintln!("Error: failed to serialize history: {}", e);
                2
            }
        },
        Err(e) => storage_error(e),
    }
}

fn run_debug(store: &Storage) -> i32 {
    match store.debug(&mut io::stdout().lock()) {
        Ok(()) => 0,
        Err(e) => storage_error(e),
    }
}

/// Interprets a command-line value: a JSON document with `--json`, a plain
/// string otherwise.
fn parse_value(raw: &str, json: bool) -> Result<Value, String> {
    if json {
        serde_json::from_str(raw).map_err(|e| format!("invalid JSON value '{}': {}", raw, e))
    } else {
        Ok(Value::String(raw.to_string()))
    }
}

fn print_json(value: &Value) -> i32 {
    println!("{}", value);
    0
}

fn storage_error(e: unitdata_storage::StorageError) -> i32 {
    if e.is_locked() {
        eprintln!("Error: unit state is locked by another process: {}", e);
    } else {
        eprintln!("Error: {}", e);
    }
    2
}
