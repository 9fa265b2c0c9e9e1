// =============================================================================
// FIELDTRACK — Load Test Tool
// =============================================================================
// Mints bearer tokens for a pool of simulated field workers and streams
// JSON location updates at the ingest endpoint at a configurable rate.
// =============================================================================

use clap::Parser;
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(name = "fieldtrack-loadtest")]
#[command(about = "Load test tool for the Fieldtrack core server")]
struct Args {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:8080")]
    url: String,

    /// JWT secret matching the server's JWT_SECRET
    #[arg(long)]
    secret: String,

    /// Simulated user ids start here
    #[arg(long, default_value_t = 1)]
    first_user: i64,

    /// Number of simulated users
    #[arg(long, default_value_t = 10)]
    users: i64,

    /// Updates per second
    #[arg(long, default_value_t = 100)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Centre latitude
    #[arg(long, default_value_t = 12.9716)]
    lat: f64,

    /// Centre longitude
    #[arg(long, default_value_t = 77.5946)]
    lon: f64,

    /// Send every update on the background endpoint
    #[arg(long, default_value_t = false)]
    background: bool,
}

struct Counters {
    sent: AtomicU64,
    accepted: AtomicU64,
    degraded: AtomicU64,
    rejected: AtomicU64,
    unauthorized: AtomicU64,
    network_error: AtomicU64,
    latency_sum_us: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            unauthorized: AtomicU64::new(0),
            network_error: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
        }
    }
}

#[derive(Serialize)]
struct Claims {
    sub: i64,
    exp: u64,
}

fn mint_token(user_id: i64, secret: &str) -> String {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        + 3600;
    encode(
        &Header::default(),
        &Claims { sub: user_id, exp },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token minting failed")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody {
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    battery_level: f64,
    speed: f64,
    is_moving: bool,
}

fn build_body(rng: &mut impl Rng, lat: f64, lon: f64) -> LocationBody {
    LocationBody {
        latitude: lat + rng.gen_range(-0.005..0.005),
        longitude: lon + rng.gen_range(-0.005..0.005),
        accuracy: rng.gen_range(3.0..60.0),
        battery_level: rng.gen_range(20.0..100.0),
        speed: rng.gen_range(0.0..15.0),
        is_moving: rng.gen_bool(0.6),
    }
}

fn main() {
    let args = Args::parse();

    let path = if args.background {
        "/employee-tracking/location/background"
    } else {
        "/employee-tracking/location"
    };
    println!("=== Fieldtrack Load Test ===");
    println!("Target:   {}{}", args.url, path);
    println!("Rate:     {} upd/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!(
        "Users:    {} (ids {}..{})",
        args.users,
        args.first_user,
        args.first_user + args.users - 1
    );
    println!();

    let tokens: Vec<String> = (args.first_user..args.first_user + args.users)
        .map(|id| mint_token(id, &args.secret))
        .collect();
    println!("Minted {} bearer tokens", tokens.len());

    // Check server health first.
    let health_url = format!("{}/health", args.url);
    match reqwest::blocking::get(&health_url) {
        Ok(r) if r.status().is_success() => println!("Server health: OK"),
        Ok(r) => {
            eprintln!("Server health check failed: {}", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot reach server: {}", e);
            std::process::exit(1);
        }
    }

    let counters = Arc::new(Counters::new());
    let ingest_url = format!("{}{}", args.url, path);

    let interval = Duration::from_micros(1_000_000 / args.rate as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("\nSending...\n");
    let start = Instant::now();

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let token = &tokens[(tick as usize) % tokens.len()];
        let body = build_body(&mut rng, args.lat, args.lon);

        let req_start = Instant::now();
        counters.sent.fetch_add(1, Ordering::Relaxed);

        match client.post(&ingest_url).bearer_auth(token).json(&body).send() {
            Ok(resp) => {
                let lat_us = req_start.elapsed().as_micros() as u64;
                counters.latency_sum_us.fetch_add(lat_us, Ordering::Relaxed);

                match resp.status().as_u16() {
                    200 => {
                        // A 200 with success=false means the payload went
                        // to the retry queue.
                        let degraded = resp
                            .json::<serde_json::Value>()
                            .map(|v| v["success"] == serde_json::Value::Bool(false))
                            .unwrap_or(false);
                        if degraded {
                            counters.degraded.fetch_add(1, Ordering::Relaxed);
                        } else {
                            counters.accepted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    401 | 403 => {
                        counters.unauthorized.fetch_add(1, Ordering::Relaxed);
                    }
                    other => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        if tick < 5 {
                            eprintln!("Unexpected status: {}", other);
                        }
                    }
                }
            }
            Err(_) => {
                counters.network_error.fetch_add(1, Ordering::Relaxed);
            }
        }

        tick += 1;

        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} accepted={} degraded={} rejected={} unauthorized={} err={} ({:.0} upd/s)",
                elapsed,
                sent,
                counters.accepted.load(Ordering::Relaxed),
                counters.degraded.load(Ordering::Relaxed),
                counters.rejected.load(Ordering::Relaxed),
                counters.unauthorized.load(Ordering::Relaxed),
                counters.network_error.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        // Rate limiting.
        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    let accepted = counters.accepted.load(Ordering::Relaxed);
    let avg_lat = if sent > 0 {
        counters.latency_sum_us.load(Ordering::Relaxed) / sent
    } else {
        0
    };

    println!("\n=== Results ===");
    println!("Duration:     {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:   {}", sent);
    println!(
        "Accepted:     {} ({:.1}%)",
        accepted,
        accepted as f64 / sent.max(1) as f64 * 100.0
    );
    println!("Degraded:     {}", counters.degraded.load(Ordering::Relaxed));
    println!("Rejected:     {}", counters.rejected.load(Ordering::Relaxed));
    println!("Unauthorized: {}", counters.unauthorized.load(Ordering::Relaxed));
    println!("Net errors:   {}", counters.network_error.load(Ordering::Relaxed));
    println!("Avg latency:  {} us", avg_lat);
    println!("Throughput:   {:.1} upd/s", sent as f64 / elapsed.as_secs_f64());
}
