use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;
/// 2030-01-01T00:00:00Z
const BASE: i64 = 1_893_456_000_000;
/// Every bench wigwam is listed for two years from `BASE`.
const LISTED_UNTIL: i64 = BASE + 730 * DAY;

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("wigwam")
        .password("wigwam");

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

/// A user owning one wigwam listed from `BASE` to `LISTED_UNTIL`, in the
/// client's tenant. Returns `(user_id, wigwam_id)`.
async fn seed_wigwam(client: &Client) -> (Ulid, Ulid) {
    let user = Ulid::new();
    let wid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO users (id) VALUES ('{user}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO wigwams (id, owner_id, name, start, "end") VALUES ('{wid}', '{user}', 'bench', {BASE}, {LISTED_UNTIL})"#
        ))
        .await
        .unwrap();
    (user, wid)
}

/// Book the `i`-th one-hour slot.
async fn rent_slot(client: &Client, wid: Ulid, user: Ulid, i: i64) -> Result<u64, tokio_postgres::Error> {
    let s = BASE + i * HOUR;
    let e = s + HOUR - 1;
    client
        .execute(
            &format!(
                r#"INSERT INTO rentals (id, wigwam_id, user_id, start, "end") VALUES ('{}', '{wid}', '{user}', {s}, {e})"#,
                Ulid::new()
            ),
            &[],
        )
        .await
}

async fn phase1_sequential_rentals(host: &str, port: u16) {
    let client = connect(host, port).await;
    let (user, wid) = seed_wigwam(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        rent_slot(&client, wid, user, i as i64).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} rentals in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("rental latency", &mut latencies);
}

async fn phase2_contended_listings(host: &str, port: u16) {
    // All tasks share one tenant and one wigwam, so every listing is
    // reconciled against the others under the same lock.
    let dbname = format!("bench_{}", Ulid::new());
    let setup = {
        let mut config = Config::new();
        config.host(host).port(port).dbname(&dbname).user("wigwam").password("wigwam");
        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(conn);
        client
    };
    let (_, wid) = seed_wigwam(&setup).await;

    let n_tasks = 10;
    let n_per_task = 200;
    let admitted = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let dbname = dbname.clone();
        let admitted = admitted.clone();
        handles.push(tokio::spawn(async move {
            let mut config = Config::new();
            config.host(&host).port(port).dbname(&dbname).user("wigwam").password("wigwam");
            let (client, conn) = config.connect(NoTls).await.expect("connect failed");
            tokio::spawn(conn);

            for j in 0..n_per_task {
                // Overlapping two-day windows past the seeded listing: most get trimmed,
                // some supersede earlier ones, some are rejected.
                let s = LISTED_UNTIL + ((j * n_tasks + t) as i64) * DAY / 3;
                let e = s + 2 * DAY;
                let sql = format!(
                    r#"INSERT INTO listings (id, wigwam_id, start, "end") VALUES ('{}', '{wid}', {s}, {e})"#,
                    Ulid::new()
                );
                if client.batch_execute(&sql).await.is_ok() {
                    admitted.fetch_add(1, Ordering::Relaxed);
                }
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
        "  {n_tasks} tasks x {n_per_task} listings = {total} total ({} admitted) in {:.2}s = {ops:.0} ops/sec",
        admitted.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
}

async fn phase3_availability_under_load(host: &str, port: u16) {
    // Writers: keep booking rentals in their own tenants.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (user, wid) = seed_wigwam(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = rent_slot(&client, wid, user, i).await;
                i += 1;
            }
        }));
    }

    // Readers: availability of a wigwam with 50 rentals cut out of it.
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (user, wid) = seed_wigwam(&client).await;
            for i in 0..50 {
                rent_slot(&client, wid, user, i * 3).await.unwrap();
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM availability WHERE wigwam_id = '{wid}'"))
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

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (user, wid) = seed_wigwam(&client).await;
            for i in 0..ops_per_conn {
                rent_slot(&client, wid, user, i).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("WIGWAM_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("WIGWAM_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid WIGWAM_PORT");

    println!("=== wigwam stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential rental throughput");
    phase1_sequential_rentals(&host, port).await;

    println!("\n[phase 2] contended listing admission");
    phase2_contended_listings(&host, port).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_availability_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
