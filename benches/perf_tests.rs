//! Producer-side latency comparison against a traditional formatting
//! logger. Run with `cargo bench`.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use deferlog::{log, Level};
use log::{info, LevelFilter};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const ITERATIONS: usize = 1_000_000;

fn bench_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("deferlog_bench_{}_{}.log", name, std::process::id()));
    let _ = fs::remove_file(&path);
    path
}

fn wait_until_stable(path: &PathBuf) {
    let mut last = 0;
    loop {
        thread::sleep(Duration::from_millis(200));
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if size == last && size > 0 {
            return;
        }
        last = size;
    }
}

fn main() {
    let deferred_path = bench_path("deferred");
    let traditional_path = bench_path("traditional");

    // Deferred-formatting logging: producers only pack binary records.
    deferlog::set_log_file(deferred_path.to_str().unwrap()).unwrap();
    deferlog::set_log_level(Level::Info);

    let start = Instant::now();
    for i in 0..ITERATIONS {
        log!(
            Level::Info,
            "perf: iteration=%zu value=%.3f tag=%s",
            i,
            3.14159,
            "steady"
        );
    }
    let produce_duration = start.elapsed();
    wait_until_stable(&deferred_path);
    let drain_duration = start.elapsed();

    // Traditional logging: the calling thread formats every line.
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} - {m}{n}")))
        .build(&traditional_path)
        .unwrap();
    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .build(Root::builder().appender("logfile").build(LevelFilter::Info))
        .unwrap();
    log4rs::init_config(config).unwrap();

    let start = Instant::now();
    for i in 0..ITERATIONS {
        info!("perf: iteration={} value={:.3} tag={}", i, 3.14159, "steady");
    }
    let traditional_duration = start.elapsed();

    println!("\nPerformance comparison ({ITERATIONS} iterations):");
    println!("Deferred logging (producer side): {produce_duration:?}");
    println!("Deferred logging (fully drained): {drain_duration:?}");
    println!("Traditional logging:              {traditional_duration:?}");
    println!(
        "Producer-side speedup: {:.2}x",
        traditional_duration.as_secs_f64() / produce_duration.as_secs_f64()
    );
    println!(
        "Throughput: {:.2} million records/sec",
        ITERATIONS as f64 / produce_duration.as_secs_f64() / 1_000_000.0
    );

    let deferred_size = fs::metadata(&deferred_path).map(|m| m.len()).unwrap_or(0);
    let traditional_size = fs::metadata(&traditional_path).map(|m| m.len()).unwrap_or(0);
    println!("\nFile size comparison:");
    println!(
        "Deferred log size:    {:.2} MB",
        deferred_size as f64 / (1024.0 * 1024.0)
    );
    println!(
        "Traditional log size: {:.2} MB",
        traditional_size as f64 / (1024.0 * 1024.0)
    );

    let _ = fs::remove_file(&deferred_path);
    let _ = fs::remove_file(&traditional_path);
}
