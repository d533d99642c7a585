use clap::Parser;
use platewatch::{
    LogLevel, init_logging,
    parking_slots::{
        DEFAULT_CAR_SLOTS, DEFAULT_DATABASE, DEFAULT_MONGODB_URI, DEFAULT_MOTORBIKE_SLOTS,
        generate_slots, seed_mongodb, summarize, write_ndjson,
    },
};
use std::{fs::File, io::BufWriter, path::PathBuf};
use tracing::info;

/// Recreates the parking slot collection in MongoDB, or writes the slot
/// documents as newline-delimited JSON with `--output`.
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), rename_all = "snake_case")]
struct Args {
    /// Number of motorbike slots, ids M001 upwards
    #[arg(long, default_value_t = DEFAULT_MOTORBIKE_SLOTS)]
    motorbike_slots: usize,

    /// Number of car slots, ids C001 upwards
    #[arg(long, default_value_t = DEFAULT_CAR_SLOTS)]
    car_slots: usize,

    /// MongoDB connection string
    #[arg(long, default_value = DEFAULT_MONGODB_URI)]
    mongodb_uri: String,

    /// Database to drop and seed
    #[arg(long, default_value = DEFAULT_DATABASE)]
    database: String,

    /// Write NDJSON to this file instead of seeding MongoDB, `-` for stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Sets the level of logging
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let to_stdout = args.output.as_deref().is_some_and(|path| path.as_os_str() == "-");
    // Logs go to stdout, so keep them quiet when documents go there too
    let log_level = if to_stdout { LogLevel::Warn } else { args.log_level };
    let _guard = init_logging(log_level, &mut None)?;

    let slots = generate_slots(args.motorbike_slots, args.car_slots);
    let summary = match &args.output {
        Some(_) if to_stdout => {
            write_ndjson(&slots, std::io::stdout().lock())?;
            summarize(&slots)
        }
        Some(path) => {
            let file = File::create(path)?;
            write_ndjson(&slots, BufWriter::new(file))?;
            info!(output = %path.display(), "Slot documents written");
            summarize(&slots)
        }
        None => seed_mongodb(&args.mongodb_uri, &args.database, &slots).await?,
    };

    info!(
        total = slots.len(),
        motorbikes = summary.motorbikes,
        cars = summary.cars,
        available = summary.available,
        "Parking slots seeded"
    );
    Ok(())
}
