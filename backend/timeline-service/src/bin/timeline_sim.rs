use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use timeline_service::cache::CacheStats;
use timeline_service::{
    metrics, Config, ContentStore, FanoutStats, FeedCache, InMemoryUserDirectory, SocialGraph,
    TimelineService,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Workload {
    users: usize,
    follows_per_user: usize,
    posts: usize,
    pages: usize,
    seed: u64,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            users: 1_000,
            follows_per_user: 50,
            posts: 5_000,
            pages: 3,
            seed: 7,
        }
    }
}

impl Workload {
    fn parse(args: &[String]) -> Result<Self> {
        let mut workload = Self::default();
        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            let value = iter
                .next()
                .with_context(|| format!("missing value for {}", flag))?;
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid value for {}: {}", flag, value))?;
            match flag.as_str() {
                "--users" => workload.users = parsed as usize,
                "--follows" => workload.follows_per_user = parsed as usize,
                "--posts" => workload.posts = parsed as usize,
                "--pages" => workload.pages = parsed as usize,
                "--seed" => workload.seed = parsed,
                other => bail!("unknown flag: {}", other),
            }
        }
        if workload.users < 2 {
            bail!("--users must be at least 2");
        }
        Ok(workload)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulationReport {
    users: usize,
    follows: usize,
    posts: usize,
    celebrity_followers: usize,
    publish_ms: u64,
    fanout_drain_ms: u64,
    read_ms: u64,
    pages_read: usize,
    entries_read: usize,
    fanout: FanoutStats,
    cache: CacheStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.app.log_level.clone().into());
    if config.app.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "simulate" => {
            let workload = Workload::parse(&args[2..])?;
            info!(env = %config.app.env, ?workload, "Starting timeline simulation");
            match simulate(config, workload).await {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(e) => {
                    error!(error = %e, "Simulation failed");
                    return Err(e);
                }
            }
        }

        "config" => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        _ => {
            println!("Timeline Simulation Tool");
            println!();
            println!("Usage:");
            println!("  timeline-sim simulate [--users N] [--follows N] [--posts N] [--pages N] [--seed N]");
            println!("  timeline-sim config");
            println!();
            println!("Commands:");
            println!("  simulate  Run a synthetic publish/read workload and print a JSON report");
            println!("  config    Print the effective configuration");
            println!();
            println!("Environment:");
            println!("  FEED_CAPACITY, FANOUT_THRESHOLD, BACKFILL_LIMIT, FANOUT_WORKERS, ...");
            println!("  RUST_LOG / LOG_LEVEL, LOG_FORMAT_JSON");
        }
    }

    Ok(())
}

async fn simulate(config: Config, workload: Workload) -> Result<SimulationReport> {
    let mut rng = StdRng::seed_from_u64(workload.seed);

    let directory = Arc::new(InMemoryUserDirectory::new());
    let users: Vec<Uuid> = (0..workload.users)
        .map(|_| {
            let id = Uuid::new_v4();
            directory.register(id);
            id
        })
        .collect();

    let content = Arc::new(ContentStore::new(
        directory.clone(),
        config.timeline.author_index_capacity,
    ));
    let cache = Arc::new(FeedCache::new(config.timeline.feed_capacity));
    let service = TimelineService::with_stores(
        config.timeline.clone(),
        Arc::new(SocialGraph::new()),
        content,
        cache.clone(),
    )?;

    // Everyone follows the first user, which lands it in pull mode whenever
    // the user count reaches the threshold.
    let celebrity = users[0];
    let mut follows = 0;
    for &user in &users[1..] {
        service.follow(user, celebrity).await?;
        follows += 1;
        for &followee in users.choose_multiple(&mut rng, workload.follows_per_user) {
            if followee != user && followee != celebrity {
                service.follow(user, followee).await?;
                follows += 1;
            }
        }
    }
    info!(follows, "Social graph built");

    let started = Instant::now();
    for i in 0..workload.posts {
        let author = if rng.gen_bool(0.05) {
            celebrity
        } else {
            users[rng.gen_range(0..users.len())]
        };
        service.publish_post(author, format!("post #{}", i)).await?;
    }
    let publish_ms = started.elapsed().as_millis() as u64;

    let started = Instant::now();
    service.flush_fanout().await;
    let fanout_drain_ms = started.elapsed().as_millis() as u64;

    let started = Instant::now();
    let mut pages_read = 0;
    let mut entries_read = 0;
    for &user in users.choose_multiple(&mut rng, 100.min(users.len())) {
        let mut cursor: Option<String> = None;
        for _ in 0..workload.pages {
            let page = service.get_feed(user, cursor.as_deref(), None).await?;
            pages_read += 1;
            entries_read += page.posts.len();
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
    }
    let read_ms = started.elapsed().as_millis() as u64;

    let fanout = service.shutdown().await;
    info!(remaining_batches = fanout.len(), "Simulation finished");
    if let Ok(text) = metrics::render() {
        tracing::debug!(metrics = %text, "Final metrics");
    }

    Ok(SimulationReport {
        users: users.len(),
        follows,
        posts: workload.posts,
        celebrity_followers: service.get_follower_count(celebrity),
        publish_ms,
        fanout_drain_ms,
        read_ms,
        pages_read,
        entries_read,
        fanout: service.fanout_stats(),
        cache: cache.stats(),
    })
}
