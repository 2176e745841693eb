use app_vault::backup::app_config::{App, AppConfig};
use app_vault::backup::batch::work::WorkMode;
use app_vault::backup::batch::BatchResult;
use app_vault::backup::catalog::DataKind;
use app_vault::backup::result_error::error::Error;
use app_vault::backup::result_error::result::Result;
use app_vault::backup::schedule::store::ScheduleStore;
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc::channel;
use tracing::error;

/// Backs up and restores app data, on demand or on a schedule
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Arm every enabled schedule and run batches as their alarms go off
    Daemon,
    /// Back up packages now
    Backup {
        #[arg(required = true)]
        packages: Vec<String>,
        /// Data kinds to include, all when omitted
        #[arg(short, long, value_parser = parse_kind)]
        kind: Vec<DataKind>,
    },
    /// Restore packages from a backup instance, the newest when none is given
    Restore {
        #[arg(required = true)]
        packages: Vec<String>,
        #[arg(short, long, value_parser = parse_kind)]
        kind: Vec<DataKind>,
        #[arg(short, long)]
        instance: Option<String>,
    },
    /// Inspect and control schedules
    Schedules {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    List,
    Enable { id: i64 },
    Disable { id: i64 },
    /// Run a schedule's batch now and wait for it
    Run { id: i64 },
}

fn parse_kind(name: &str) -> std::result::Result<DataKind, String> {
    DataKind::parse(name).ok_or_else(|| format!("unknown data kind {name:?}"))
}

fn kinds(requested: Vec<DataKind>) -> BTreeSet<DataKind> {
    if requested.is_empty() {
        DataKind::ALL.into_iter().collect()
    } else {
        requested.into_iter().collect()
    }
}

fn local_time(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Prints the batch outcome; true when every item succeeded.
fn report(result: &BatchResult) -> bool {
    println!("{}: {}", result.batch_name, result.status());
    for (id, item) in &result.per_item {
        match &item.error {
            Some(e) => println!("  {id} {}: {e}", item.state),
            None => println!("  {id} {}", item.state),
        }
    }
    result.succeeded()
}

fn run(args: Args) -> Result<bool> {
    let config = AppConfig::load(&args.config)?;
    let (fired_tx, fired_rx) = channel();
    let app: App = config.build(fired_tx)?;
    app.shell.init()?;
    let now = Local::now().format("%Y-%m-%d %H:%M:%S");

    match args.command {
        Command::Daemon => {
            app.service.run_daemon(fired_rx)?;
            Ok(true)
        }
        Command::Backup { packages, kind } => {
            let result = app.run_packages(
                &format!("backup @ {now}"),
                &packages,
                &kinds(kind),
                WorkMode::Backup,
            )?;
            Ok(report(&result))
        }
        Command::Restore {
            packages,
            kind,
            instance,
        } => {
            let result = app.run_packages(
                &format!("restore @ {now}"),
                &packages,
                &kinds(kind),
                WorkMode::Restore { instance },
            )?;
            Ok(report(&result))
        }
        Command::Schedules { command } => {
            let service = &app.service;
            match command {
                ScheduleCommand::List => {
                    for schedule in service.scheduler().store().all()? {
                        println!(
                            "{:>4} {:<24} {:<8} every {} day(s) at {:02}:{:02}, next {}",
                            schedule.id,
                            schedule.name,
                            if schedule.enabled { "enabled" } else { "disabled" },
                            schedule.interval,
                            schedule.time_hour,
                            schedule.time_minute,
                            local_time(schedule.time_to_run)
                        );
                    }
                    Ok(true)
                }
                ScheduleCommand::Enable { id } => {
                    println!("Schedule {id} runs next at {}", local_time(service.enable(id)?));
                    Ok(true)
                }
                ScheduleCommand::Disable { id } => {
                    service.disable(id)?;
                    println!("Schedule {id} disabled");
                    Ok(true)
                }
                ScheduleCommand::Run { id } => match service.fire(id)? {
                    Some(batch) => Ok(report(&batch.wait())),
                    None => Err(Error::NotFound(format!("schedule {id} is disabled or running"))),
                },
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match run(args) {
        Ok(true) => exit(0),
        Ok(false) => exit(2),
        Err(e) => {
            error!("{e}");
            exit(1)
        }
    }
}
