//! Basic usage example for the rater-admission crate.

use rater_admission::{
    AdmissionEngine, AdmissionEngineBuilder, AdmissionResult, Identity, QueueOutcome,
    RateLimitConfig, Scope, SubmitOptions,
};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    println!("=== Basic Admission Example ===\n");

    // Example 1: Direct admission and rate limiting
    simple_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 2: Concurrency cap and queueing
    queueing_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 3: Administering configs
    admin_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 4: Monitoring metrics
    metrics_example();
}

fn simple_example() {
    println!("1. Direct Admission:");

    let engine = AdmissionEngine::new();
    engine
        .create_config(Scope::Default, RateLimitConfig::new(5, 100, 1000))
        .unwrap();
    println!("   Default record: 5/min, 100/hr, 1000/day, 3 concurrent");

    let id = Identity::user("alice");
    let mut admitted = 0;
    let mut queued = Vec::new();

    for i in 1..=8 {
        match engine.submit(&id) {
            AdmissionResult::Admitted(permit) => {
                admitted += 1;
                println!("   Request {} - ✅ Admitted", i);
                // Work happens here; dropping the permit frees the slot
                drop(permit);
            }
            AdmissionResult::Queued(ticket) => {
                println!(
                    "   Request {} - ⏳ Queued at position {} (~{:?})",
                    i,
                    ticket.position(),
                    ticket.estimated_wait()
                );
                queued.push(ticket);
            }
            AdmissionResult::Rejected(reason) => {
                println!("   Request {} - ❌ Rejected: {}", i, reason);
            }
        }
    }

    println!(
        "   Results: {} admitted, {} waiting for the next minute",
        admitted,
        queued.len()
    );
}

fn queueing_example() {
    println!("2. Concurrency Cap and Queueing:");

    let engine = AdmissionEngineBuilder::new().tick_interval_ms(10).build();
    engine
        .create_config(
            Scope::user("bob"),
            RateLimitConfig::default().with_concurrency(1),
        )
        .unwrap();
    let supervisor = engine.start_supervisor().expect("spawn supervisor");
    println!("   bob may run 1 request at a time");

    let id = Identity::user("bob");
    let first = engine.submit(&id).into_permit().expect("first is admitted");
    println!("   Request 1 - ✅ Admitted");

    let handles: Vec<_> = (2..=4)
        .map(|i| {
            let engine = engine.clone();
            let id = id.clone();
            thread::spawn(move || {
                let options = SubmitOptions::new().max_wait(Duration::from_secs(2));
                match engine.submit_with(&id, options) {
                    AdmissionResult::Queued(ticket) => {
                        println!("   Request {} - ⏳ Queued", i);
                        match ticket.blocking_wait() {
                            QueueOutcome::Admitted(permit) => {
                                println!("   Request {} - ✅ Admitted from queue", i);
                                thread::sleep(Duration::from_millis(20));
                                permit.release();
                            }
                            QueueOutcome::Rejected(reason) => {
                                println!("   Request {} - ❌ {}", i, reason);
                            }
                        }
                    }
                    other => println!("   Request {} - {:?}", i, other),
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    println!("   Releasing request 1");
    first.release();

    for handle in handles {
        handle.join().unwrap();
    }
    supervisor.stop();
}

fn admin_example() {
    println!("3. Administering Configs:");

    let engine = AdmissionEngine::new();
    let record = engine
        .create_config(Scope::api_key("key-1"), RateLimitConfig::new(100, 1000, 10_000))
        .unwrap();
    println!("   Created {} at version {}", record.scope, record.version);

    let record = engine
        .update_config(
            &Scope::api_key("key-1"),
            RateLimitConfig::new(200, 2000, 20_000).with_priority(5),
        )
        .unwrap();
    println!("   Updated {} to version {}", record.scope, record.version);

    match engine.create_config(Scope::api_key("key-1"), RateLimitConfig::default()) {
        Ok(_) => println!("   Unexpected duplicate create"),
        Err(e) => println!("   Duplicate create refused: {}", e),
    }

    match engine.create_config(Scope::user("carol"), RateLimitConfig::new(0, 10, 10)) {
        Ok(_) => println!("   Unexpected invalid create"),
        Err(e) => println!("   Invalid create refused: {}", e),
    }

    let caller = Identity::api_key("key-1").with_user("carol");
    let resolved = engine.resolve(&caller);
    println!(
        "   {:?} resolves to {} ({}/min, priority {})",
        caller,
        resolved.matched(),
        resolved.config().requests_per_minute,
        resolved.config().priority
    );

    for record in engine.list_configs() {
        println!("   - {} v{}", record.scope, record.version);
    }
}

fn metrics_example() {
    println!("4. Monitoring Metrics:");

    let engine = AdmissionEngineBuilder::new().max_queue_size(5).build();
    engine
        .create_config(Scope::Default, RateLimitConfig::new(2, 100, 1000))
        .unwrap();

    let id = Identity::user("dave");
    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(engine.submit(&id));
    }

    let metrics = engine.metrics();
    println!("   {}", metrics.summary());
    println!("   Health: {}", metrics.health_status());
    if metrics.health_status().is_unhealthy() {
        println!("   Suggested: {}", metrics.health_status().suggested_action());
    }

    let telemetry = engine.queue_telemetry();
    println!(
        "   Queue: {}/{} ({:.0}% full), estimate {:.3}s",
        telemetry.queue_size,
        telemetry.max_size,
        telemetry.utilization() * 100.0,
        telemetry.process_time_estimate
    );

    println!("   Cleared {} queued requests", engine.clear_queue());
}
