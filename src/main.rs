use anyhow::{bail, Context, Result};
use callsign_queue::{db, logging, AppConfig, QrzLogbookClient, Verifier};
use chrono::Utc;
use std::env;

fn print_usage() {
    eprintln!("Usage: callsign-queue <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  show     Print the persisted queue");
    eprintln!("  check    Fetch confirmations once and list entries that would be removed");
    eprintln!();
    eprintln!("Settings come from the environment (QUEUE_DB_PATH, QRZ_API_KEY, ...).");
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args: Vec<String> = env::args().collect();
    let config = AppConfig::from_env()?;

    match args.get(1).map(String::as_str) {
        Some("show") => run_show(&config),
        Some("check") => run_check(&config).await,
        _ => {
            print_usage();
            std::process::exit(2);
        }
    }
}

fn run_show(config: &AppConfig) -> Result<()> {
    let conn = db::open_database(&config.db_path)?;
    let entries = db::load_entries(&conn)?;
    let station = db::load_station_config(&conn)?.unwrap_or_else(|| config.station.clone());

    println!("📻 {} on {}", station.operator_name, station.frequency);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for position in 1..=config.capacity {
        match entries.iter().find(|e| e.position == position) {
            Some(entry) => {
                let location = entry.location.as_deref().unwrap_or("-");
                println!(
                    "{:>2}. {:<20} {:<20} {}",
                    position,
                    entry.callsign,
                    location,
                    entry.entered_at.format("%H:%M UTC")
                );
            }
            None => println!("{:>2}. (free)", position),
        }
    }

    let stray = entries.iter().filter(|e| e.position > config.capacity).count();
    if stray > 0 {
        println!("\n⚠️  {} stored entries lie beyond capacity {}", stray, config.capacity);
    }

    Ok(())
}

async fn run_check(config: &AppConfig) -> Result<()> {
    let Some(qrz) = config.qrz() else {
        bail!("QRZ_API_KEY is not set");
    };

    println!("🔍 Checking QRZ logbook (key {})", qrz.masked_key());

    let conn = db::open_database(&config.db_path)?;
    let entries = db::load_entries(&conn)?;

    let client = QrzLogbookClient::new(qrz)?;
    let since = config.reconciler.window.since(Utc::now());
    let confirmed = client
        .fetch_confirmed(since)
        .await
        .context("QRZ fetch failed")?;

    println!("✓ {} confirmed callsigns", confirmed.len());

    let matched: Vec<_> = entries
        .iter()
        .filter(|entry| confirmed.contains(&entry.callsign))
        .collect();

    if matched.is_empty() {
        println!("✓ No queued entries would be removed");
    } else {
        println!("\nWould remove:");
        for entry in matched {
            println!("  {:>2}. {}", entry.position, entry.callsign);
        }
    }

    Ok(())
}
