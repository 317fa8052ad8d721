///
/// baton-demo - Round-robin scheduling demonstration
///
/// Starts N cooperative threads that each log their id and yield K times,
/// then prints the resulting schedule and each thread's exit code:
/// - baton-demo --threads 3 --yields 2
/// - baton-demo --threads 4 --yields 3 --exit-after 2
/// - baton-demo --config baton.toml --verbose
///

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use baton_runtime::{Scheduler, SchedulerConfig, ThreadAttributes, ThreadId};

#[derive(Parser)]
#[command(name = "baton-demo")]
#[command(author, version, about = "Cooperative round-robin threads on a baton relay", long_about = None)]
struct Cli {
    /// Number of worker threads
    #[arg(short, long, default_value_t = 3)]
    threads: usize,

    /// Turns each worker takes before returning
    #[arg(short, long, default_value_t = 2)]
    yields: usize,

    /// Make the first worker call exit after this many turns
    #[arg(long)]
    exit_after: Option<usize>,

    /// Scheduler config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log every handoff
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_max_level(if cli.verbose {
            tracing::Level::TRACE
        } else {
            tracing::Level::INFO
        })
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {}", message);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let config = match &cli.config {
        Some(path) => SchedulerConfig::from_path(path).map_err(|e| e.to_string())?,
        None => SchedulerConfig::default(),
    };
    let sched = Scheduler::new(config).map_err(|e| e.to_string())?;

    let log: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let workers: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    // The starter holds the baton while it creates the workers, so every
    // worker is queued before the first one runs.
    let starter = {
        let handle = sched.clone();
        let log = Arc::clone(&log);
        let workers = Arc::clone(&workers);
        let (threads, yields, exit_after) = (cli.threads, cli.yields, cli.exit_after);
        sched.create(&ThreadAttributes::named("starter"), move || {
            for index in 0..threads {
                let worker = handle.clone();
                let log = Arc::clone(&log);
                let attrs = ThreadAttributes::named(format!("worker-{}", index + 1));
                let created = handle.create(&attrs, move || {
                    for turn in 0..yields {
                        if index == 0 && exit_after == Some(turn) {
                            worker.exit(100 + turn as i32);
                        }
                        log.lock().unwrap_or_else(|e| e.into_inner()).push(worker.current());
                        worker.yield_now();
                    }
                    index as i32 + 1
                });
                match created {
                    Ok(id) => workers.lock().unwrap_or_else(|e| e.into_inner()).push(id),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to create worker");
                        return 1;
                    }
                }
            }
            0
        })
    }
    .map_err(|e| e.to_string())?;

    let starter_code = sched.join(starter).map_err(|e| e.to_string())?;
    if starter_code != 0 {
        return Err(format!("starter thread exited with {}", starter_code));
    }

    let ids = workers.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let mut codes = Vec::with_capacity(ids.len());
    for id in &ids {
        codes.push((*id, sched.join(*id).map_err(|e| e.to_string())?));
    }
    sched.shutdown();

    let schedule: Vec<String> = log
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .map(ThreadId::to_string)
        .collect();
    println!("schedule: {}", schedule.join(" "));
    for (id, code) in codes {
        println!("thread {} exited with {}", id, code);
    }
    Ok(())
}
