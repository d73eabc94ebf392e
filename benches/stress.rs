use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("parkade")
        .password("parkade");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Seed one lot with `n_spots` spots and a user into this connection's tenant.
/// Returns (lot, spots, user).
async fn seed_tenant(
    client: &tokio_postgres::Client,
    n_spots: usize,
) -> (Ulid, Vec<Ulid>, Ulid) {
    let lot = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO lots (id, name, address) VALUES ('{lot}', 'Bench Lot', '1 Bench Way')"
        ))
        .await
        .unwrap();

    let mut spots = Vec::with_capacity(n_spots);
    for i in 0..n_spots {
        let spot = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO spots (id, lot_id, spot_number) VALUES ('{spot}', '{lot}', 'S{i:03}')"
            ))
            .await
            .unwrap();
        spots.push(spot);
    }

    let user = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, email, first_name, last_name) VALUES ('{user}', '{user}@bench.example', 'Bench', 'User')"
        ))
        .await
        .unwrap();

    (lot, spots, user)
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let (_lot, spots, user) = seed_tenant(&client, 1).await;
    let spot = spots[0];

    let n = 2000;
    let base = now_ms() + HOUR;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let rid = Ulid::new();
        let s = base + (i as i64) * HOUR;
        let e = s + HOUR;
        let t = Instant::now();
        client
            .batch_execute(&format!(
                r#"INSERT INTO reservations (id, user_id, spot_id, start, "end") VALUES ('{rid}', '{user}', '{spot}', {s}, {e})"#
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            // Each task uses its own tenant (unique dbname from connect())
            let client = connect(&host, port).await;
            let (_lot, spots, user) = seed_tenant(&client, 1).await;
            let spot = spots[0];

            let base = now_ms() + HOUR;
            for j in 0..n_per_task {
                let rid = Ulid::new();
                let s = base + (j as i64) * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, user_id, spot_id, start, "end") VALUES ('{rid}', '{user}', '{spot}', {s}, {e})"#
                    ))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contended_spot(host: &str, port: u16) {
    // Many connections fight over ONE spot and the SAME window: exactly one
    // admission per window must win, the rest observe slot conflicts.
    let setup = connect(host, port).await;
    let (_lot, spots, _user) = seed_tenant(&setup, 1).await;
    let spot = spots[0];

    // All workers share the tenant via raw reconnect with the same dbname —
    // simpler to just run the contention through the one client sequentially
    // re-using windows is pointless, so spawn tasks sharing this client.
    let client = std::sync::Arc::new(setup);
    let n_windows = 50;
    let n_contenders = 8;
    let base = now_ms() + HOUR;

    let mut admitted = 0usize;
    let mut conflicts = 0usize;
    let start = Instant::now();

    for w in 0..n_windows {
        let s = base + (w as i64) * HOUR;
        let e = s + HOUR;
        let mut handles = Vec::new();
        for _ in 0..n_contenders {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let user = Ulid::new();
                client
                    .batch_execute(&format!(
                        "INSERT INTO users (id, email, first_name, last_name) VALUES ('{user}', '{user}@bench.example', 'C', 'U')"
                    ))
                    .await
                    .unwrap();
                let rid = Ulid::new();
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, user_id, spot_id, start, "end") VALUES ('{rid}', '{user}', '{spot}', {s}, {e})"#
                    ))
                    .await
            }));
        }
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(_) => conflicts += 1,
            }
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {n_windows} windows x {n_contenders} contenders: {admitted} admitted, {conflicts} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(admitted, n_windows, "exactly one admission per window");
}

async fn phase4_read_under_load(host: &str, port: u16) {
    // Writers churn reservations in their own tenants while readers time
    // availability queries against pre-filled tenants.
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (_lot, spots, user) = seed_tenant(&client, 1).await;
            let spot = spots[0];
            let base = now_ms() + HOUR;
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let rid = Ulid::new();
                let s = base + i * HOUR;
                let e = s + HOUR;
                let _ = client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, user_id, spot_id, start, "end") VALUES ('{rid}', '{user}', '{spot}', {s}, {e})"#
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (lot, spots, user) = seed_tenant(&client, 20).await;
            // Make availability non-trivial: book out a quarter of the spots
            let base = now_ms() + HOUR;
            for spot in spots.iter().take(5) {
                let rid = Ulid::new();
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, user_id, spot_id, start, "end") VALUES ('{rid}', '{user}', '{spot}', {base}, {})"#,
                        base + 4 * HOUR
                    ))
                    .await
                    .unwrap();
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        "SELECT * FROM availability WHERE start >= {base} AND \"end\" <= {} AND lot_id = '{lot}' AND limit = 50",
                        base + 2 * HOUR
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase5_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (_lot, spots, user) = seed_tenant(&client, 1).await;
            let spot = spots[0];

            let base = now_ms() + HOUR;
            for i in 0..ops_per_conn {
                let rid = Ulid::new();
                let s = base + (i as i64) * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, user_id, spot_id, start, "end") VALUES ('{rid}', '{user}', '{spot}', {s}, {e})"#
                    ))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("PARKADE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PARKADE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid PARKADE_PORT");

    println!("=== parkade stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] contended-spot admission");
    phase3_contended_spot(&host, port).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&host, port).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
