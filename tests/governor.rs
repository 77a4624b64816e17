use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use protmerge::clock::{Clock, ManualClock};
use protmerge::governor::{RateGovernor, RatePolicy};

#[test]
fn rapid_requests_respect_spacing_and_daily_ceiling() {
    let clock = Arc::new(ManualClock::new());
    let governor = RateGovernor::new(RatePolicy::default(), clock.clone());

    let mut granted = Vec::new();
    let mut refused = 0;
    for _ in 0..150 {
        match governor.acquire_slot() {
            Ok(grant) => granted.push(grant.granted_at),
            Err(err) => {
                assert_eq!(err.ceiling, 100);
                refused += 1;
            }
        }
    }

    assert_eq!(granted.len(), 100);
    assert_eq!(refused, 50);
    for pair in granted.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(10));
    }
    assert!(granted[99] - granted[0] < Duration::from_secs(24 * 60 * 60));
}

#[test]
fn concurrent_callers_never_share_a_spacing_window() {
    let clock = Arc::new(ManualClock::new());
    let governor = RateGovernor::new(RatePolicy::default(), clock.clone());
    let granted = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..20 {
                    if let Ok(grant) = governor.acquire_slot() {
                        granted.lock().unwrap().push(grant.granted_at);
                    }
                }
            });
        }
    });

    let mut granted = granted.into_inner().unwrap();
    granted.sort();
    assert_eq!(granted.len(), 100);
    for pair in granted.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(10));
    }
}

#[test]
fn budget_recovers_after_window() {
    let clock = Arc::new(ManualClock::new());
    let policy = RatePolicy {
        daily_ceiling: 3,
        ..RatePolicy::default()
    };
    let governor = RateGovernor::new(policy, clock.clone());
    for _ in 0..3 {
        governor.acquire_slot().unwrap();
    }
    let err = governor.acquire_slot().unwrap_err();
    assert_eq!(err.used, 3);

    clock.advance(err.retry_after);
    let grant = governor.acquire_slot().unwrap();
    assert_eq!(grant.used_in_window, 3);
    assert!(clock.now() >= grant.granted_at);
}

#[test]
fn polls_and_submissions_from_many_threads_are_spaced() {
    let clock = Arc::new(ManualClock::new());
    let governor = Arc::new(RateGovernor::new(RatePolicy::default(), clock.clone()));

    thread::scope(|scope| {
        for worker in 0..4 {
            let governor = Arc::clone(&governor);
            scope.spawn(move || {
                for n in 0..5 {
                    if (worker + n) % 2 == 0 {
                        governor.acquire_slot().unwrap();
                    } else {
                        governor.acquire_spacing();
                    }
                }
            });
        }
    });

    // Only the governor moves the clock: twenty requests, nineteen spacings.
    assert_eq!(clock.elapsed(), Duration::from_secs(190));
    assert_eq!(governor.snapshot().used, 10);
}
