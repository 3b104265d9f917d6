use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;

use bucketgate::local::{LocalTokenBucket, LocalTokenBucketOptions};
use bucketgate::{BucketDefaults, BucketGateError, Capacity, Rate, RateLimitDecision};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Provider {
    Local,
    Redis,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyDist {
    Hot,
    Uniform,
    Skewed,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Mode {
    Max,
    TargetQps,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bucketgate-stress",
    about = "Load test / benchmark harness for bucketgate"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Provider::Local)]
    provider: Provider,

    #[arg(long, value_enum, default_value_t = KeyDist::Hot)]
    key_dist: KeyDist,

    #[arg(long, value_enum, default_value_t = Mode::Max)]
    mode: Mode,

    #[arg(long, default_value_t = 8)]
    threads: usize,

    #[arg(long, default_value_t = 60)]
    duration_s: u64,

    /// Tokens per second refilled into every bucket.
    #[arg(long, default_value_t = 1000.0)]
    rate: f64,

    /// Burst size of every bucket.
    #[arg(long, default_value_t = 100.0)]
    capacity: f64,

    #[arg(long, default_value_t = 100000)]
    key_space: usize,

    #[arg(long, default_value_t = 0.8)]
    hot_fraction: f64,

    #[arg(long, default_value_t = 100)]
    sample_every: u64,

    #[arg(long)]
    target_qps: Option<u64>,

    #[arg(long, default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    /// A random suffix is appended so every run starts from cold buckets.
    #[arg(long, default_value = "stress")]
    redis_prefix: String,
}

struct Counts {
    admitted: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
    admitted_per_key: Vec<AtomicU64>,
}

impl Counts {
    fn new(keys: usize) -> Self {
        Self {
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            admitted_per_key: (0..keys).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn record(&self, key_idx: usize, res: Result<RateLimitDecision, BucketGateError>) {
        match res {
            Ok(RateLimitDecision::Admitted { .. }) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                self.admitted_per_key[key_idx].fetch_add(1, Ordering::Relaxed);
            }
            Ok(RateLimitDecision::Denied { .. }) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn build_defaults(args: &Args) -> BucketDefaults {
    BucketDefaults::new(
        Rate::try_from(args.rate).unwrap(),
        Capacity::try_from(args.capacity).unwrap(),
    )
}

fn build_keys(args: &Args) -> Vec<String> {
    let n = match args.key_dist {
        KeyDist::Hot => 1,
        _ => args.key_space.max(1),
    };
    (0..n).map(|i| format!("origin_{i}")).collect()
}

fn should_sample(iter: u64, sample_every: u64) -> bool {
    if sample_every <= 1 {
        return true;
    }

    iter.is_multiple_of(sample_every)
}

fn per_op_pause(args: &Args) -> Option<Duration> {
    if args.mode == Mode::Max {
        return None;
    }

    let qps = args.target_qps?;
    Some(Duration::from_nanos(1_000_000_000u64 / qps.max(1)))
}

fn pick_key(args: &Args, key_count: usize, rng_u64: &mut impl FnMut() -> u64) -> usize {
    match args.key_dist {
        KeyDist::Hot => 0,
        KeyDist::Uniform => (rng_u64() as usize) % key_count,
        KeyDist::Skewed => {
            let r = (rng_u64() % 10_000) as f64 / 10_000.0;
            if r < args.hot_fraction {
                0
            } else {
                let tail = key_count.saturating_sub(1).max(1);
                (1 + (rng_u64() as usize) % tail) % key_count
            }
        }
    }
}

fn xorshift(seed: u64) -> impl FnMut() -> u64 {
    let mut seed = seed;
    move || {
        // xorshift64*
        seed ^= seed >> 12;
        seed ^= seed << 25;
        seed ^= seed >> 27;
        seed = seed.wrapping_mul(0x2545_F491_4F6C_DD1D);
        seed
    }
}

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap()
}

fn print_results(args: &Args, elapsed: Duration, hist: &Histogram<u64>, counts: &Counts) {
    let admitted = counts.admitted.load(Ordering::Relaxed);
    let denied = counts.denied.load(Ordering::Relaxed);
    let errors = counts.errors.load(Ordering::Relaxed);
    let ops = admitted + denied + errors;

    println!("provider={:?} mode={:?}", args.provider, args.mode);
    println!(
        "threads={} duration_s={} rate={} capacity={} key_dist={:?} key_space={}",
        args.threads, args.duration_s, args.rate, args.capacity, args.key_dist, args.key_space
    );
    println!(
        "elapsed_s={:.3} ops={} ops_per_s={:.0}",
        elapsed.as_secs_f64(),
        ops,
        ops as f64 / elapsed.as_secs_f64()
    );
    println!("admitted={admitted} denied={denied} errors={errors}");

    // No key may ever admit more than its burst plus what refilled meanwhile.
    let ceiling = args.capacity + args.rate * elapsed.as_secs_f64();
    let (busiest, busiest_admitted) = counts
        .admitted_per_key
        .iter()
        .map(|count| count.load(Ordering::Relaxed))
        .enumerate()
        .max_by_key(|(_, count)| *count)
        .unwrap_or((0, 0));
    println!(
        "busiest_key=origin_{busiest} admitted={busiest_admitted} ceiling={ceiling:.0} ok={}",
        busiest_admitted as f64 <= ceiling
    );

    if !hist.is_empty() {
        println!(
            "lat_us p50={} p95={} p99={} p999={} max={}",
            hist.value_at_quantile(0.50),
            hist.value_at_quantile(0.95),
            hist.value_at_quantile(0.99),
            hist.value_at_quantile(0.999),
            hist.max()
        );
        println!("sample_every={} samples={}", args.sample_every, hist.len());
    } else {
        println!("no latency samples collected");
    }
}

fn run_local(args: &Args) {
    let keys = build_keys(args);
    let defaults = build_defaults(args);
    let buckets = Arc::new(LocalTokenBucket::new(LocalTokenBucketOptions::default()));

    let stop = Arc::new(AtomicBool::new(false));
    let counts = Arc::new(Counts::new(keys.len()));

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration_s);

    let mut handles = Vec::with_capacity(args.threads);
    for t in 0..args.threads {
        let buckets = Arc::clone(&buckets);
        let keys = keys.clone();
        let stop = Arc::clone(&stop);
        let counts = Arc::clone(&counts);
        let args = args.clone();

        handles.push(std::thread::spawn(move || {
            let mut hist = new_histogram();
            let mut i = 0_u64;
            let mut rng_u64 = xorshift((t as u64 + 1) * 0x9E37_79B9_7F4A_7C15);
            let pause = per_op_pause(&args);
            let mut next_deadline = Instant::now();

            while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                if let Some(pause) = pause {
                    let now = Instant::now();
                    if now < next_deadline {
                        std::thread::sleep(next_deadline - now);
                    }
                    next_deadline += pause;
                }

                i = i.wrapping_add(1);
                let idx = pick_key(&args, keys.len(), &mut rng_u64);
                let t0 = should_sample(i, args.sample_every).then(Instant::now);

                let res = buckets.acquire_one(&keys[idx], &defaults);

                if let Some(t0) = t0 {
                    let us = t0.elapsed().as_micros() as u64;
                    let _ = hist.record(us.max(1));
                }

                counts.record(idx, res);
            }

            hist
        }));
    }

    std::thread::sleep(Duration::from_secs(args.duration_s));
    stop.store(true, Ordering::Relaxed);

    let mut merged = new_histogram();
    for h in handles {
        let hist = h.join().unwrap();
        merged.add(&hist).unwrap();
    }

    print_results(args, started.elapsed(), &merged, &counts);
}

#[cfg(feature = "redis-tokio")]
fn run_redis(args: &Args) {
    use bucketgate::redis::{RedisKey, RedisTokenBucketOptions};
    use bucketgate::{RateLimiter, RateLimiterOptions};

    let args = args.clone();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads.max(2))
        .build()
        .unwrap();

    rt.block_on(async move {
        let keys = build_keys(&args);
        let defaults = build_defaults(&args);
        let client = redis::Client::open(args.redis_url.as_str()).unwrap();

        let rl = Arc::new(RateLimiter::new(RateLimiterOptions {
            local: LocalTokenBucketOptions::default(),
            redis: RedisTokenBucketOptions {
                connection_manager: client.get_connection_manager().await.unwrap(),
                prefix: Some(RedisKey::try_from(run_prefix(&args.redis_prefix)).unwrap()),
                idle_ttl: Some(Duration::from_secs(args.duration_s + 60)),
            },
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let counts = Arc::new(Counts::new(keys.len()));

        let started = Instant::now();
        let deadline = started + Duration::from_secs(args.duration_s);

        let mut join = Vec::with_capacity(args.threads);
        for t in 0..args.threads {
            let rl = Arc::clone(&rl);
            let stop = Arc::clone(&stop);
            let counts = Arc::clone(&counts);
            let args = args.clone();
            let keys = keys.clone();

            join.push(tokio::spawn(async move {
                let mut hist = new_histogram();
                let mut i = 0_u64;
                let mut rng_u64 = xorshift((t as u64 + 1) * 0xD134_2543_DE82_EF95);
                let pause = per_op_pause(&args);
                let mut next_deadline = Instant::now();

                let redis_keys: Vec<RedisKey> = keys
                    .iter()
                    .map(|k| RedisKey::try_from(k.as_str()).unwrap())
                    .collect();

                while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                    if let Some(pause) = pause {
                        let now = Instant::now();
                        if now < next_deadline {
                            tokio::time::sleep(next_deadline - now).await;
                        }
                        next_deadline += pause;
                    }

                    i = i.wrapping_add(1);
                    let idx = pick_key(&args, redis_keys.len(), &mut rng_u64);
                    let t0 = should_sample(i, args.sample_every).then(Instant::now);

                    let res = rl.redis().acquire_one(&redis_keys[idx], &defaults).await;

                    if let Some(t0) = t0 {
                        let us = t0.elapsed().as_micros() as u64;
                        let _ = hist.record(us.max(1));
                    }

                    counts.record(idx, res);
                }

                hist
            }));
        }

        tokio::time::sleep(Duration::from_secs(args.duration_s)).await;
        stop.store(true, Ordering::Relaxed);

        let mut merged = new_histogram();
        for j in join {
            let hist = j.await.unwrap();
            merged.add(&hist).unwrap();
        }

        print_results(&args, started.elapsed(), &merged, &counts);
    });
}

#[cfg(any(feature = "redis-tokio", test))]
fn run_prefix(base: &str) -> String {
    format!("{base}_{}", rand::random::<u32>())
}

#[cfg(not(feature = "redis-tokio"))]
fn run_redis(_: &Args) {
    eprintln!(
        "redis provider requires: cargo run -p bucketgate-stress --features redis-tokio -- ..."
    );
    std::process::exit(2);
}

fn main() {
    let args = Args::parse();
    match args.provider {
        Provider::Local => run_local(&args),
        Provider::Redis => run_redis(&args),
    }
}
