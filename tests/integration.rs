use rater_admission::{
    AdmissionEngine, AdmissionEngineBuilder, AdmissionResult, EngineConfig, Identity,
    ManualClock, QueueOutcome, RateLimitConfig, RejectReason, Scope, SubmitOptions, Ticket, Tier,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3_600);
const DAY: Duration = Duration::from_secs(86_400);

fn manual_engine(builder: AdmissionEngineBuilder) -> (AdmissionEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let engine = builder.clock(clock.clone()).build();
    (engine, clock)
}

#[test]
fn test_scenario_concurrency_cap_then_release() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new());
    engine
        .create_config(
            Scope::user("u"),
            RateLimitConfig::new(2, 200, 1_000).with_concurrency(1),
        )
        .unwrap();
    let id = Identity::user("u");

    let first = engine.submit(&id).into_permit().unwrap();
    let mut second = engine.submit(&id).into_ticket().unwrap();
    let mut third = engine.submit(&id).into_ticket().unwrap();
    assert_eq!(second.position(), 0);
    assert_eq!(third.position(), 1);

    drop(first);
    let second_permit = second.try_outcome().unwrap().into_permit().unwrap();
    assert!(third.try_outcome().is_none());

    // The minute budget of 2 is now spent, so releasing again does not help
    drop(second_permit);
    assert!(third.try_outcome().is_none());
    assert_eq!(engine.window_count(&Scope::user("u"), Tier::Minute), 2);
}

#[test]
fn test_scenario_concurrency_cap_with_tiny_queue() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new().max_queue_size(1));
    engine
        .create_config(
            Scope::user("u"),
            RateLimitConfig::new(2, 200, 1_000).with_concurrency(1),
        )
        .unwrap();
    let id = Identity::user("u");

    let _first = engine.submit(&id).into_permit().unwrap();
    let _second = engine.submit(&id).into_ticket().unwrap();
    let third = engine.submit(&id);
    assert_eq!(third.reject_reason(), Some(RejectReason::QueueFull));
    assert_eq!(engine.queue_size(), 1);
    assert_eq!(engine.metrics().rejected_queue_full, 1);
}

#[test]
fn test_scenario_priority_wins_for_freed_slot() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new().global_concurrent_limit(1));
    engine
        .create_config(Scope::user("low"), RateLimitConfig::default().with_priority(0))
        .unwrap();
    engine
        .create_config(Scope::user("high"), RateLimitConfig::default().with_priority(10))
        .unwrap();

    let holder = engine.submit(&Identity::user("holder")).into_permit().unwrap();

    // Low priority arrives first
    let mut low = engine.submit(&Identity::user("low")).into_ticket().unwrap();
    let mut high = engine.submit(&Identity::user("high")).into_ticket().unwrap();
    assert_eq!(high.position(), 0);

    drop(holder);
    let high_permit = high.try_outcome().unwrap().into_permit().unwrap();
    assert!(low.try_outcome().is_none());

    drop(high_permit);
    assert!(low.try_outcome().unwrap().is_admitted());
}

#[test]
fn test_scenario_unlimited_identity_never_queues() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new());
    engine
        .create_config(
            Scope::Default,
            RateLimitConfig::new(1, 1, 1).with_concurrency(1),
        )
        .unwrap();
    engine
        .create_config(
            Scope::api_key("admin"),
            RateLimitConfig::new(1, 1, 1).with_unlimited(true),
        )
        .unwrap();

    let admin = Identity::api_key("admin");
    let mut permits = Vec::with_capacity(1000);
    for _ in 0..1000 {
        match engine.submit(&admin) {
            AdmissionResult::Admitted(permit) => permits.push(permit),
            other => panic!("unlimited identity got {:?}", other),
        }
    }

    let metrics = engine.metrics();
    assert_eq!(metrics.admitted_unlimited, 1000);
    assert_eq!(metrics.total_queued, 0);
    assert_eq!(engine.queue_size(), 0);

    // Everyone else is still limited by the default record
    assert!(engine.submit(&Identity::user("x")).is_admitted());
}

#[test]
fn test_scenario_day_tier_blocks_with_minute_headroom() {
    let (engine, clock) = manual_engine(AdmissionEngineBuilder::new().no_default_max_wait());
    engine
        .create_config(Scope::user("u"), RateLimitConfig::new(100, 100, 3))
        .unwrap();
    let id = Identity::user("u");
    let subject = Scope::user("u");

    for _ in 0..3 {
        engine.submit(&id).into_permit().unwrap().release();
        clock.advance(HOUR);
    }

    let mut blocked = engine.submit(&id).into_ticket().unwrap();
    engine.drain();
    assert!(blocked.try_outcome().is_none());

    // No tier was charged for the blocked request
    assert_eq!(engine.window_count(&subject, Tier::Minute), 0);
    assert_eq!(engine.window_count(&subject, Tier::Hour), 0);
    assert_eq!(engine.window_count(&subject, Tier::Day), 3);

    clock.advance(DAY);
    assert_eq!(engine.drain(), 1);
    assert!(blocked.try_outcome().unwrap().is_admitted());
    assert_eq!(engine.window_count(&subject, Tier::Day), 1);
}

#[test]
fn test_ordering_law_under_concurrent_submissions() {
    let (engine, _) = manual_engine(
        AdmissionEngineBuilder::new()
            .global_concurrent_limit(1)
            .max_queue_size(1_000),
    );
    for priority in [0, 5, 10] {
        engine
            .create_config(
                Scope::user(format!("p{}", priority)),
                RateLimitConfig::new(1_000, 1_000, 1_000)
                    .with_concurrency(100)
                    .with_priority(priority),
            )
            .unwrap();
    }

    let holder = engine.submit(&Identity::user("holder")).into_permit().unwrap();

    let handles: Vec<_> = (0..6)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                let priority = [0, 5, 10][t % 3];
                let id = Identity::user(format!("p{}", priority));
                (0..20)
                    .map(|_| {
                        let ticket = engine.submit(&id).into_ticket().unwrap();
                        (priority, ticket)
                    })
                    .collect::<Vec<(i32, Ticket)>>()
            })
        })
        .collect();

    let mut waiting: Vec<(i32, Ticket)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(engine.queue_size(), 120);

    drop(holder);

    let mut served: Vec<(i32, u64)> = Vec::new();
    while !waiting.is_empty() {
        let mut resolved = Vec::new();
        for (i, (_, ticket)) in waiting.iter_mut().enumerate() {
            if let Some(outcome) = ticket.try_outcome() {
                resolved.push((i, outcome));
            }
        }
        assert_eq!(resolved.len(), 1, "exactly one entry holds the only slot");

        let (index, outcome) = resolved.pop().unwrap();
        let (priority, ticket) = waiting.remove(index);
        served.push((priority, ticket.id()));
        drop(ticket);
        drop(outcome);
    }

    for pair in served.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!(
            a.0 > b.0 || (a.0 == b.0 && a.1 < b.1),
            "served {:?} before {:?}",
            a,
            b
        );
    }
}

#[test]
fn test_clear_queue_is_idempotent() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new());
    engine
        .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
        .unwrap();
    let id = Identity::user("u");

    let _permit = engine.submit(&id).into_permit().unwrap();
    let tickets: Vec<Ticket> = (0..5)
        .map(|_| engine.submit(&id).into_ticket().unwrap())
        .collect();

    assert_eq!(engine.clear_queue(), 5);
    assert_eq!(engine.queue_size(), 0);
    assert_eq!(engine.clear_queue(), 0);
    assert_eq!(engine.queue_size(), 0);

    for ticket in tickets {
        assert_eq!(
            ticket.blocking_wait().reject_reason(),
            Some(RejectReason::ClearedByAdministrator)
        );
    }
}

#[test]
fn test_cancel_keeps_remaining_order() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new());
    engine
        .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
        .unwrap();
    let id = Identity::user("u");

    let first = engine.submit(&id).into_permit().unwrap();
    let mut a = engine.submit(&id).into_ticket().unwrap();
    let b = engine.submit(&id).into_ticket().unwrap();
    let mut c = engine.submit(&id).into_ticket().unwrap();
    assert_eq!(c.current_position(), Some(2));

    assert!(b.cancel());
    assert_eq!(c.current_position(), Some(1));
    assert_eq!(engine.metrics().cancelled, 1);

    drop(first);
    let a_permit = a.try_outcome().unwrap().into_permit().unwrap();
    assert!(c.try_outcome().is_none());
    drop(a_permit);
    assert!(c.try_outcome().unwrap().is_admitted());
}

#[test]
fn test_cancel_after_admission_releases_slot() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new());
    engine
        .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
        .unwrap();
    let id = Identity::user("u");

    let first = engine.submit(&id).into_permit().unwrap();
    let ticket = engine.submit(&id).into_ticket().unwrap();
    drop(first);
    assert_eq!(engine.in_flight(&Scope::user("u")), 1);

    // Too late to cancel; the permit inside the ticket is released instead
    assert!(!ticket.cancel());
    assert_eq!(engine.in_flight(&Scope::user("u")), 0);
}

#[test]
fn test_double_release_is_counted_not_fatal() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new());
    let subject = Scope::user("u");

    assert!(!engine.release(&subject));

    let scope = engine
        .submit(&Identity::user("u"))
        .into_permit()
        .unwrap()
        .detach()
        .unwrap();
    assert!(engine.release(&scope));
    assert!(!engine.release(&scope));

    assert_eq!(engine.in_flight(&subject), 0);
    let metrics = engine.metrics();
    assert_eq!(metrics.double_releases, 2);
    assert!(metrics.health_status().is_unhealthy());

    // Still serving
    assert!(engine.submit(&Identity::user("u")).is_admitted());
}

#[test]
fn test_per_entry_timeout_and_default_timeout() {
    let (engine, clock) = manual_engine(
        AdmissionEngineBuilder::new().default_max_wait(Duration::from_secs(30)),
    );
    engine
        .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
        .unwrap();
    let id = Identity::user("u");

    let _permit = engine.submit(&id).into_permit().unwrap();
    let mut short = engine
        .submit_with(&id, SubmitOptions::new().max_wait(Duration::from_secs(5)))
        .into_ticket()
        .unwrap();
    let mut default = engine.submit(&id).into_ticket().unwrap();

    clock.advance(Duration::from_secs(5));
    engine.drain();
    assert_eq!(
        short.try_outcome().unwrap().reject_reason(),
        Some(RejectReason::Timeout)
    );
    assert!(default.try_outcome().is_none());

    clock.advance(Duration::from_secs(25));
    engine.drain();
    assert_eq!(
        default.try_outcome().unwrap().reject_reason(),
        Some(RejectReason::Timeout)
    );
    assert_eq!(engine.metrics().timed_out, 2);
}

#[test]
fn test_config_precedence_end_to_end() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new());
    engine
        .create_config(Scope::Default, RateLimitConfig::new(10, 100, 1_000))
        .unwrap();
    engine
        .create_config(Scope::user("u"), RateLimitConfig::new(20, 100, 1_000))
        .unwrap();
    engine
        .create_config(Scope::api_key("k"), RateLimitConfig::new(30, 100, 1_000))
        .unwrap();

    let caller = Identity::api_key("k").with_user("u");
    assert_eq!(engine.resolve(&caller).config().requests_per_minute, 30);

    engine.delete_config(&Scope::api_key("k")).unwrap();
    assert_eq!(engine.resolve(&caller).config().requests_per_minute, 20);

    engine.delete_config(&Scope::user("u")).unwrap();
    assert_eq!(engine.resolve(&caller).config().requests_per_minute, 10);

    engine.delete_config(&Scope::Default).unwrap();
    let resolved = engine.resolve(&caller);
    assert!(resolved.is_fallback());
    assert_eq!(resolved.config(), &RateLimitConfig::default());
}

#[test]
fn test_priority_copied_at_enqueue() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new().global_concurrent_limit(1));
    engine
        .create_config(Scope::user("a"), RateLimitConfig::default().with_priority(1))
        .unwrap();
    engine
        .create_config(Scope::user("b"), RateLimitConfig::default().with_priority(2))
        .unwrap();

    let holder = engine.submit(&Identity::user("holder")).into_permit().unwrap();
    let mut b = engine.submit(&Identity::user("b")).into_ticket().unwrap();
    let mut a = engine.submit(&Identity::user("a")).into_ticket().unwrap();

    // Raising a's priority does not reorder the entry already waiting
    engine
        .update_config(&Scope::user("a"), RateLimitConfig::default().with_priority(50))
        .unwrap();

    drop(holder);
    let _b = b.try_outcome().unwrap().into_permit().unwrap();
    assert!(a.try_outcome().is_none());
}

#[test]
fn test_cap_invariant_under_contention() {
    let engine = AdmissionEngineBuilder::new()
        .tick_interval_ms(5)
        .max_queue_size(10_000)
        .build();
    engine
        .create_config(
            Scope::user("shared"),
            RateLimitConfig::new(100_000, 100_000, 100_000).with_concurrency(2),
        )
        .unwrap();
    let supervisor = engine.start_supervisor().unwrap();

    let running = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let running = running.clone();
            thread::spawn(move || {
                let id = Identity::user("shared");
                for _ in 0..50 {
                    let permit = match engine.submit(&id) {
                        AdmissionResult::Admitted(permit) => permit,
                        AdmissionResult::Queued(ticket) => match ticket.blocking_wait() {
                            QueueOutcome::Admitted(permit) => permit,
                            QueueOutcome::Rejected(reason) => panic!("rejected: {}", reason),
                        },
                        AdmissionResult::Rejected(reason) => panic!("rejected: {}", reason),
                    };
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    assert!(now <= 2, "{} requests running with a cap of 2", now);
                    assert!(engine.in_flight(&Scope::user("shared")) <= 2);
                    running.fetch_sub(1, Ordering::SeqCst);
                    permit.release();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    supervisor.stop();

    let metrics = engine.metrics();
    assert_eq!(metrics.total_admitted(), 400);
    assert_eq!(metrics.in_flight, 0);
    assert_eq!(metrics.queue_size, 0);
    assert_eq!(metrics.double_releases, 0);
}

#[test]
fn test_supervisor_expires_entries_in_real_time() {
    let engine = AdmissionEngine::with_config(EngineConfig {
        tick_interval_ms: 5,
        ..EngineConfig::default().with_default_max_wait(Some(Duration::from_millis(30)))
    });
    engine
        .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
        .unwrap();
    let supervisor = engine.start_supervisor().unwrap();

    let _permit = engine.submit(&Identity::user("u")).into_permit().unwrap();
    let ticket = engine.submit(&Identity::user("u")).into_ticket().unwrap();

    assert_eq!(ticket.blocking_wait().reject_reason(), Some(RejectReason::Timeout));
    supervisor.stop();
}

#[tokio::test]
async fn test_ticket_can_be_awaited() {
    let engine = AdmissionEngine::new();
    engine
        .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
        .unwrap();
    let id = Identity::user("u");

    let first = engine.submit(&id).into_permit().unwrap();
    let ticket = engine.submit(&id).into_ticket().unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(first);
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), ticket)
        .await
        .expect("ticket resolved");
    assert!(outcome.is_admitted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_future_cancels_entry() {
    let engine = AdmissionEngine::new();
    engine
        .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
        .unwrap();
    let id = Identity::user("u");

    let _first = engine.submit(&id).into_permit().unwrap();
    let ticket = engine.submit(&id).into_ticket().unwrap();
    assert_eq!(engine.queue_size(), 1);

    let timed_out = tokio::time::timeout(Duration::from_millis(20), ticket).await;
    assert!(timed_out.is_err());
    assert_eq!(engine.queue_size(), 0);
    assert_eq!(engine.metrics().cancelled, 1);
}

#[test]
fn test_window_rollover_readmits_on_drain() {
    let (engine, clock) = manual_engine(AdmissionEngineBuilder::new());
    engine
        .create_config(Scope::api_key("k"), RateLimitConfig::new(1, 10, 10))
        .unwrap();
    let id = Identity::api_key("k");

    let _a = engine.submit(&id).into_permit().unwrap();
    let mut waiting = engine.submit(&id).into_ticket().unwrap();

    clock.advance(MINUTE - Duration::from_millis(1));
    assert_eq!(engine.drain(), 0);

    clock.advance(Duration::from_millis(1));
    assert_eq!(engine.drain(), 1);
    assert!(waiting.try_outcome().unwrap().is_admitted());
    assert_eq!(engine.metrics().window_rollovers, 1);
}

#[test]
fn test_telemetry_snapshot_serializes() {
    let (engine, _) = manual_engine(AdmissionEngineBuilder::new().max_queue_size(25));
    let telemetry = engine.queue_telemetry();
    let json = serde_json::to_string(&telemetry).unwrap();
    assert_eq!(
        json,
        r#"{"queue_size":0,"max_size":25,"process_time_estimate":0.0}"#
    );

    let metrics = serde_json::to_value(engine.metrics()).unwrap();
    assert_eq!(metrics["max_queue_size"], 25);
}
