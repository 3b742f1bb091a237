use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use flightwatch_core::Snapshot;
use flightwatch_storage::{SnapshotRead, SnapshotStore};
use flightwatch_sync::{
    build_scheduler, sort_by_arrival, watcher_from_config, SyncConfig, SyncPipeline,
};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flightwatch")]
#[command(about = "Destination arrival watcher: scrape, persist, and alert on arrivals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scrape pipeline once and write the snapshot.
    Scrape {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run only the arrival watcher on its interval.
    Watch,
    /// Scrape now, then keep scraping and watching on their intervals.
    Run,
    /// Print the latest snapshot.
    Show,
    /// Serve the snapshot as JSON over HTTP.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape { json: false }) {
        Commands::Scrape { json } => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let summary = pipeline.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "scrape complete: run_id={} flights={} next={} failed_routes={} snapshot={}",
                    summary.run_id,
                    summary.total_flights,
                    summary.next_arrival.as_deref().unwrap_or("none"),
                    summary.route_failures.len(),
                    summary.snapshot_path
                );
            }
        }
        Commands::Watch => {
            let watcher = Arc::new(Mutex::new(watcher_from_config(&config)?));
            run_until_ctrl_c(None, Some(watcher), &config).await?;
        }
        Commands::Run => {
            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            pipeline.run_once().await?;
            let watcher = Arc::new(Mutex::new(watcher_from_config(&config)?));
            run_until_ctrl_c(Some(pipeline), Some(watcher), &config).await?;
        }
        Commands::Show => {
            let store = SnapshotStore::new(config.snapshot_path.clone());
            match store.load().await {
                SnapshotRead::Loaded(snapshot) => {
                    print!("{}", render_board(&snapshot, Local::now().naive_local()));
                }
                SnapshotRead::Missing => println!("No flight data yet. Run `flightwatch scrape` first."),
                SnapshotRead::Unreadable(reason) => println!("Flight data unavailable: {reason}"),
            }
        }
        Commands::Serve => {
            flightwatch_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn run_until_ctrl_c(
    pipeline: Option<Arc<SyncPipeline>>,
    watcher: Option<Arc<Mutex<flightwatch_sync::ArrivalWatcher>>>,
    config: &SyncConfig,
) -> Result<()> {
    let mut sched = build_scheduler(pipeline, watcher, config).await?;
    sched.start().await.context("starting scheduler")?;
    info!(
        scrape_every_secs = config.scrape_interval_secs,
        watch_every_secs = config.watch_interval_secs,
        "scheduler running; ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn render_board(snapshot: &Snapshot, now: NaiveDateTime) -> String {
    let mut out = format!(
        "Last updated: {}\nTotal flights: {}\n",
        snapshot.generated_at.format("%Y-%m-%d %H:%M:%S"),
        snapshot.total_flights
    );
    match &snapshot.next_arrival_flight {
        Some(next) => {
            let eta = next
                .minutes_until_arrival(now)
                .map(|m| format!("{m} min"))
                .unwrap_or_else(|| "unknown".into());
            out.push_str(&format!(
                "Next arrival: {} from {} at {} ({eta})\n",
                next.flight_number, next.origin_city, next.destination_actual_time
            ));
        }
        None => out.push_str("Next arrival: none\n"),
    }

    let mut flights = snapshot.flights.clone();
    sort_by_arrival(now, &mut flights);
    for flight in &flights {
        out.push_str(&format!(
            "{:<8} {:<14} {} -> {}  {}{}\n",
            flight.flight_number,
            flight.status_text,
            flight.origin_actual_time,
            flight.destination_actual_time,
            flight.origin_city,
            flight
                .tail_number
                .as_deref()
                .map(|fin| format!("  FIN {fin}"))
                .unwrap_or_default()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use flightwatch_core::{Flight, FlightStatus};

    fn flight(number: &str, arrives: &str) -> Flight {
        Flight {
            flight_number: number.into(),
            status_text: "On Time".into(),
            status: FlightStatus::OnTime,
            origin_scheduled_time: "06:00".into(),
            origin_actual_time: "06:00".into(),
            origin_city: "Montreal YUL".into(),
            destination_scheduled_time: arrives.into(),
            destination_actual_time: arrives.into(),
            destination_city: "Toronto YTZ".into(),
            tail_number: Some("7723".into()),
            tracking_url: None,
        }
    }

    #[test]
    fn board_lists_next_arrival_and_flights_from_now() {
        let now = NaiveDate::from_ymd_opt(2025, 4, 13)
            .unwrap()
            .and_hms_opt(20, 0, 0)
            .unwrap();
        let soon = flight("AC2", "20:30");
        let snapshot = Snapshot::new(now, Some(soon.clone()), vec![flight("AC1", "07:10"), soon]);
        let board = render_board(&snapshot, now);

        assert!(board.contains("Total flights: 2"));
        assert!(board.contains("Next arrival: AC2 from Montreal YUL at 20:30 (30 min)"));
        let rows = board.lines().skip(3).collect::<Vec<_>>();
        assert!(rows[0].starts_with("AC2 "));
        assert!(rows[1].starts_with("AC1 "));
        assert!(board.contains("FIN 7723"));
    }
}
