use queuectl::config::Config;
use queuectl::jobs::{JobState, JobsRepo, NewJob, Transition};
use queuectl::settings::SettingsRepo;
use queuectl::{db, service, shutdown, telemetry};
use std::env;

const USAGE: &str = "\
queuectl - background job queue

Usage:
  queuectl enqueue '{\"id\":\"job1\",\"command\":\"sleep 2\"}'
  queuectl worker start [--count N]
  queuectl status
  queuectl list [--state pending|processing|completed|failed|dead]
  queuectl dlq list
  queuectl dlq retry <job-id>
  queuectl config set <key> <value>
  queuectl config get <key>
  queuectl config list

Uses QUEUECTL_DATABASE_URL (default sqlite://queue.db).
";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1).map(String::as_str) else {
        usage_error(None);
    };
    if matches!(command, "help" | "--help" | "-h") {
        print!("{USAGE}");
        return Ok(());
    }

    // worker logs are the point of `worker start`; everything else stays quiet
    telemetry::init(if command == "worker" { "info" } else { "warn" });

    let cfg = Config::from_env()?;
    let pool = db::connect(&cfg.database_url).await?;
    let jobs = JobsRepo::new(pool.clone()).with_lease_seconds(cfg.lease_seconds);
    let settings = SettingsRepo::new(pool.clone());

    let sub = args.get(2).map(String::as_str);

    let result = match (command, sub) {
        ("enqueue", Some(raw)) => enqueue(&jobs, raw).await,
        ("worker", Some("start")) => {
            let count = match flag_value(&args, "--count") {
                Some(raw) => match raw.parse::<usize>() {
                    Ok(n) if n > 0 => n,
                    _ => usage_error(Some(format!("--count must be a positive integer, got '{raw}'").as_str())),
                },
                None => 1,
            };
            start_workers(&cfg, pool, count).await
        }
        ("status", _) => status(&jobs).await,
        ("list", _) => {
            let state = match flag_value(&args, "--state") {
                Some(raw) => match raw.parse::<JobState>() {
                    Ok(st) => Some(st),
                    Err(e) => usage_error(Some(e.as_str())),
                },
                None => None,
            };
            list(&jobs, state).await
        }
        ("dlq", Some("list")) => dlq_list(&jobs).await,
        ("dlq", Some("retry")) => match args.get(3) {
            Some(job_id) => dlq_retry(&jobs, job_id).await,
            None => usage_error(Some("usage: queuectl dlq retry <job-id>")),
        },
        ("config", Some("set")) => match (args.get(3), args.get(4)) {
            (Some(key), Some(value)) => config_set(&settings, key, value).await,
            _ => usage_error(Some("usage: queuectl config set <key> <value>")),
        },
        ("config", Some("get")) => match args.get(3) {
            Some(key) => config_get(&settings, key).await,
            None => usage_error(Some("usage: queuectl config get <key>")),
        },
        ("config", Some("list")) => config_list(&settings).await,
        _ => usage_error(Some(format!("unknown command: {}", args[1..].join(" ")).as_str())),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    Ok(())
}

fn usage_error(msg: Option<&str>) -> ! {
    if let Some(msg) = msg {
        eprintln!("{msg}\n");
    }
    eprint!("{USAGE}");
    std::process::exit(2);
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .map(|i| args.get(i + 1).map(String::as_str).unwrap_or(""))
}

async fn enqueue(jobs: &JobsRepo, raw: &str) -> anyhow::Result<()> {
    let new_job: NewJob =
        serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("invalid job JSON: {e}"))?;

    let job = jobs.enqueue(new_job).await?;
    println!("Job enqueued: {}", job.id);
    println!("  Command:     {}", job.command);
    println!("  Max retries: {}", job.max_retries);
    Ok(())
}

async fn start_workers(cfg: &Config, pool: sqlx::SqlitePool, count: usize) -> anyhow::Result<()> {
    let token = shutdown::install_shutdown_handler();
    println!("Started {count} worker(s). Press Ctrl+C to stop.");

    let clean = service::run_workers(cfg, pool, count, token).await?;
    if clean {
        println!("All workers stopped");
    } else {
        println!("Stopped waiting; unfinished jobs will be reclaimed when their lease expires");
    }
    Ok(())
}

async fn status(jobs: &JobsRepo) -> anyhow::Result<()> {
    let stats = jobs.stats().await?;
    let holders = jobs.active_lease_holders().await?;

    println!("\nQueue Status:");
    println!("  Pending:    {}", stats.pending);
    println!("  Processing: {}", stats.processing);
    println!("  Completed:  {}", stats.completed);
    println!("  Failed:     {}", stats.failed);
    println!("  Dead:       {}", stats.dead);
    println!("  Workers:    {holders} active\n");
    Ok(())
}

async fn list(jobs: &JobsRepo, state: Option<JobState>) -> anyhow::Result<()> {
    let rows = jobs.list_jobs(state).await?;

    match state {
        Some(st) => println!("\nJobs ({st}):"),
        None => println!("\nJobs:"),
    }
    for job in rows {
        println!(
            "  {} - {} - attempts: {}/{}",
            job.id, job.state, job.attempts, job.max_retries
        );
    }
    println!();
    Ok(())
}

async fn dlq_list(jobs: &JobsRepo) -> anyhow::Result<()> {
    let rows = jobs.list_dlq().await?;

    println!("\nDead Letter Queue:");
    for job in rows {
        println!(
            "  {} - {} - attempts: {}",
            job.id, job.command, job.attempts
        );
        if let Some(err) = job.last_error.as_deref() {
            println!("      last error: {err}");
        }
    }
    println!();
    Ok(())
}

async fn dlq_retry(jobs: &JobsRepo, job_id: &str) -> anyhow::Result<()> {
    match jobs.retry_from_dlq(job_id).await? {
        Transition::Applied(job) => {
            println!("Job {} moved back to pending", job.id);
            Ok(())
        }
        Transition::Unchanged(job) => {
            anyhow::bail!("job {} is {}, only dead jobs can be retried", job.id, job.state)
        }
    }
}

async fn config_set(settings: &SettingsRepo, key: &str, value: &str) -> anyhow::Result<()> {
    settings.set(key, value).await?;
    println!("Config updated: {key} = {value}");
    Ok(())
}

async fn config_get(settings: &SettingsRepo, key: &str) -> anyhow::Result<()> {
    let all = settings.list().await?;
    match all.get(key) {
        Some(value) => println!("{value}"),
        None => println!("null"),
    }
    Ok(())
}

async fn config_list(settings: &SettingsRepo) -> anyhow::Result<()> {
    println!("\nConfiguration:");
    for (key, value) in settings.list().await? {
        println!("  {key}: {value}");
    }
    println!();
    Ok(())
}
