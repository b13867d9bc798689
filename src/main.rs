//! granite-recovery - inspect and recover a Granite data directory
//!
//! Commands:
//! - `recover`     open the directory, run startup recovery, print the report
//! - `dump`        list every log record, oldest first, then a count per kind
//! - `trail`       print the newest-first log trail
//! - `checkpoint`  recover, then take a non-quiescent checkpoint
//!
//! Every command opens the database, so recovery always runs first.

use std::path::PathBuf;

use log::info;

use granite_recovery::recovery::inspect::{kind_counts, log_trail, records_oldest_first};
use granite_recovery::recovery::{CancelToken, CheckpointOutcome};
use granite_recovery::{Config, Database};

fn print_help() {
    println!("granite-recovery - WAL crash recovery for a Granite data directory");
    println!();
    println!("Usage: granite-recovery [OPTIONS] <COMMAND>");
    println!();
    println!("Commands:");
    println!("  recover       Run startup recovery and print what it did");
    println!("  dump          List all log records, oldest first, with counts per kind");
    println!("  trail         Print the log trail, newest first");
    println!("  checkpoint    Take a non-quiescent checkpoint");
    println!();
    println!("Options:");
    println!("  -d, --data-dir DIR    Data directory (default: ./data)");
    println!("  -c, --config FILE     JSON configuration file");
    println!("  -a, --all             trail: do not stop at the first checkpoint");
    println!("  -h, --help            Show this help");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_file: Option<PathBuf> = None;
    let mut data_dir: Option<PathBuf> = None;
    let mut command: Option<String> = None;
    let mut full_trail = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_file = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--all" | "-a" => full_trail = true,
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                if command.is_some() {
                    return Err(format!("unexpected argument '{}'", other).into());
                }
                command = Some(other.to_string());
            }
        }
        i += 1;
    }

    let mut config = match &config_file {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }

    let command = match command {
        Some(command) => command,
        None => {
            print_help();
            return Err("no command given".into());
        }
    };

    info!("Opening {:?}", config.data_dir);
    let db = Database::open(config)?;

    match command.as_str() {
        "recover" => {
            let report = db.recovery_report();
            println!("window start:       {:?}", report.window_start);
            println!("window records:     {}", report.window_len);
            println!("changes redone:     {}", report.redone);
            println!("changes undone:     {}", report.undone);
            println!("rolled back:        {:?}", report.losers);
            println!("max transaction id: {}", report.max_txn_id);
            println!("checkpoint LSN:     {}", report.checkpoint_lsn);
        }
        "dump" => {
            for (lsn, record) in records_oldest_first(db.log())? {
                println!("{:>8}  {}", lsn, record);
            }
            println!();
            for (kind, count) in kind_counts(db.log())? {
                println!("{:<18}{}", kind.to_string(), count);
            }
        }
        "trail" => {
            println!("{}", log_trail(db.log(), !full_trail)?);
        }
        "checkpoint" => match db.checkpoint(&CancelToken::new())? {
            CheckpointOutcome::Completed {
                start_lsn,
                end_lsn,
                pages_flushed,
                ..
            } => println!(
                "checkpoint LSN {}..{}, {} pages flushed",
                start_lsn, end_lsn, pages_flushed
            ),
            other => println!("checkpoint not completed: {:?}", other),
        },
        other => {
            print_help();
            return Err(format!("unknown command '{}'", other).into());
        }
    }

    db.close()?;
    Ok(())
}
