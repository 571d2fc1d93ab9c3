//! Priority scheduling example: a shared concurrency cap served in priority order.

use rater_admission::{
    AdmissionEngineBuilder, AdmissionResult, Identity, QueueOutcome, RateLimitConfig, Scope,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Priority Queue Example ===\n");

    // Example 1: Priority beats arrival order
    priority_order_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 2: Unlimited keys bypass everything
    unlimited_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 3: Async callers
    async_example();
}

fn priority_order_example() {
    println!("1. Priority Beats Arrival Order:");

    let engine = AdmissionEngineBuilder::new()
        .global_concurrent_limit(1)
        .tick_interval_ms(10)
        .build();
    for (user, priority) in [("batch", 0), ("standard", 5), ("premium", 10)] {
        engine
            .create_config(
                Scope::user(user),
                RateLimitConfig::default().with_priority(priority),
            )
            .unwrap();
    }
    let supervisor = engine.start_supervisor().expect("spawn supervisor");
    println!("   One slot shared by everyone; batch=0, standard=5, premium=10");

    let holder = engine
        .submit(&Identity::user("holder"))
        .into_permit()
        .expect("slot is free");

    let served = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();

    // Lowest priority arrives first
    for user in ["batch", "batch", "standard", "premium", "standard", "premium"] {
        let ticket = match engine.submit(&Identity::user(user)) {
            AdmissionResult::Queued(ticket) => ticket,
            other => panic!("expected to queue, got {:?}", other),
        };
        println!("   {:<8} queued as #{}", user, ticket.id());

        let served = served.clone();
        handles.push(thread::spawn(move || {
            let id = ticket.id();
            if let QueueOutcome::Admitted(permit) = ticket.blocking_wait() {
                served.lock().unwrap().push(format!("{}#{}", user, id));
                thread::sleep(Duration::from_millis(5));
                drop(permit);
            }
        }));
        // Give each waiter time to block before the next arrives
        thread::sleep(Duration::from_millis(2));
    }

    drop(holder);
    for handle in handles {
        handle.join().unwrap();
    }
    supervisor.stop();

    println!("   Served order: {}", served.lock().unwrap().join(" → "));
}

fn unlimited_example() {
    println!("2. Unlimited Keys:");

    let engine = AdmissionEngineBuilder::new().build();
    engine
        .create_config(Scope::Default, RateLimitConfig::new(1, 1, 1).with_concurrency(1))
        .unwrap();
    engine
        .create_config(Scope::api_key("ops"), RateLimitConfig::unlimited())
        .unwrap();

    let ops = Identity::api_key("ops");
    let permits: Vec<_> = (0..500)
        .filter_map(|_| engine.submit(&ops).into_permit())
        .collect();
    println!("   ops key admitted {} requests with no queueing", permits.len());

    let _guest = engine.submit(&Identity::user("guest"));
    let second = engine.submit(&Identity::user("guest"));
    println!(
        "   guest's second request: queued={}",
        second.is_queued()
    );
    println!("   {}", engine.metrics().summary());
}

fn async_example() {
    println!("3. Async Callers:");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build runtime");

    runtime.block_on(async {
        let engine = AdmissionEngineBuilder::new().build();
        engine
            .create_config(
                Scope::user("svc"),
                RateLimitConfig::default().with_concurrency(1),
            )
            .unwrap();

        let id = Identity::user("svc");
        let first = engine.submit(&id).into_permit().expect("slot is free");
        let ticket = engine.submit(&id).into_ticket().expect("cap reached");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            println!("   First request finished");
            drop(first);
        });

        match ticket.await {
            QueueOutcome::Admitted(_permit) => println!("   Awaited ticket ✅ admitted"),
            QueueOutcome::Rejected(reason) => println!("   Awaited ticket ❌ {}", reason),
        }
    });
}
