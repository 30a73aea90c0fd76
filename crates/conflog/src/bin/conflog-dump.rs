//! Inspection tool for a configuration-log directory.
//!
//! Opens a store directory and prints segment metadata, sparse-index
//! entries, or records in a log-index range. Missing or corrupt index
//! files are rebuilt on open, exactly as the library does at startup.

use clap::{Parser, Subcommand};
use conflog::{DiskLog, StoreConfig, OPEN_END_ID};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "conflog-dump")]
#[command(about = "Inspect a conflog data directory")]
#[command(version)]
struct Args {
    /// Store directory
    #[arg(short, long, default_value = "./conflog_data")]
    dir: String,

    /// File-name prefix of the store's segments
    #[arg(short, long, default_value = "CONF")]
    prefix: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every segment with its metadata
    Segments,

    /// Print the sparse-index entries of every segment
    Index,

    /// Print records whose range overlaps [from, to]
    Records {
        /// Lower bound of the query range (inclusive)
        #[arg(long)]
        from: u64,

        /// Upper bound of the query range (inclusive)
        #[arg(long, default_value_t = u64::MAX)]
        to: u64,
    },

    /// Print the newest record
    Last,
}

fn end_id_display(end_id: u64) -> String {
    if end_id == OPEN_END_ID {
        "open".to_string()
    } else {
        end_id.to_string()
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let config = StoreConfig::new(&args.dir, args.prefix.as_str());

    let log = match DiskLog::open(&config) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("failed to open {}: {err}", args.dir);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Segments => {
            for segment in log.segments() {
                let meta = segment.meta();
                println!(
                    "{}  records={} size={} min={} max={} sections={}",
                    segment.data_path().display(),
                    meta.record_count,
                    meta.data_file_size,
                    meta.min_id,
                    end_id_display(meta.max_id),
                    segment.index().entries().len(),
                );
            }
            Ok(())
        }
        Commands::Index => {
            for segment in log.segments() {
                println!("{}", segment.data_path().display());
                for entry in segment.index().entries() {
                    println!("  start_id={} offset={}", entry.start_id, entry.offset);
                }
            }
            Ok(())
        }
        Commands::Records { from, to } => log.list_between(from, to).map(|records| {
            for record in records {
                println!(
                    "[{}, {}]  {} payload bytes",
                    record.start_id,
                    end_id_display(record.end_id),
                    record.payload.len(),
                );
            }
        }),
        Commands::Last => log.last().map(|record| {
            println!(
                "[{}, {}]  {} payload bytes",
                record.start_id,
                end_id_display(record.end_id),
                record.payload.len(),
            );
        }),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
