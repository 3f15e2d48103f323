use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use txtimer::cli::{Cli, OutputFormat};
use txtimer::clock::MINUTE_MS;
use txtimer::{Clock, StdoutSink, SystemClock, TxTimer, TxTimerConfig};

const GROUPS: [&str; 2] = ["db", "http"];

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// System clock that can be pushed forward, so the minute just recorded
/// falls inside the reporting window without waiting for it to end
#[derive(Default)]
struct DemoClock {
    offset: AtomicI64,
}

impl DemoClock {
    fn skip_minute(&self) {
        self.offset.fetch_add(MINUTE_MS, Ordering::SeqCst);
    }
}

impl Clock for DemoClock {
    fn now_millis(&self) -> i64 {
        SystemClock.now_millis() + self.offset.load(Ordering::SeqCst)
    }
}

fn load_config(args: &Cli) -> Result<TxTimerConfig> {
    let config = match &args.config {
        Some(path) => TxTimerConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TxTimerConfig::from_env()?,
    };
    Ok(config)
}

/// One worker: random transactions until the deadline, rotating through
/// the three session styles
fn generate_load(timer: &TxTimer, args: &Cli, worker: usize, deadline: Instant) -> usize {
    let mut rng = rand::thread_rng();
    let mut done = 0;
    while Instant::now() < deadline {
        let group = GROUPS[rng.gen_range(0..GROUPS.len())];
        let name = format!("tx-{}", rng.gen_range(0..args.transactions));
        let latency = Duration::from_millis(rng.gen_range(1..=args.max_latency_ms.max(1)));
        let code = i32::from(rng.gen::<f64>() < args.failure_rate);

        match (worker + done) % 3 {
            0 => {
                timer.start(group, &name);
                thread::sleep(latency);
                timer.stop();
            }
            1 => {
                let token = timer.enter(group, &name);
                thread::sleep(latency);
                timer.exit(token, code);
            }
            _ => {
                let guard = timer.guard(group, &name);
                thread::sleep(latency);
                guard.finish(code);
            }
        }
        done += 1;
    }
    done
}

fn main() -> Result<()> {
    let args = Cli::parse();
    if let Err(msg) = args.validate() {
        anyhow::bail!(msg);
    }

    init_tracing(args.debug);

    let config = load_config(&args)?;
    let clock = Arc::new(DemoClock::default());
    let timer = TxTimer::with_parts(config, Arc::new(StdoutSink), clock.clone())?;

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let total: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..args.threads)
            .map(|worker| {
                let timer = &timer;
                let args = &args;
                scope.spawn(move || generate_load(timer, args, worker, deadline))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or(0)).sum()
    });
    tracing::info!(total, "load finished");

    clock.skip_minute();
    match args.format {
        OutputFormat::Text => {
            timer.report_now();
        }
        OutputFormat::Json => {
            println!("{}", timer.snapshot_json()?);
        }
    }
    timer.shutdown();

    Ok(())
}
