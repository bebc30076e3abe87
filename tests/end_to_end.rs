//! End-to-end scenarios exercising connectors composed together, the way a
//! caller would actually build a pipeline rather than unit-testing one
//! connector in isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spark_flow::adapters::{Apply, Effect, Transform};
use spark_flow::clock::TestClock;
use spark_flow::connectors::{
    Backoff, Concurrent, Contest, Fallback, Handle, Race, RateLimiter, Retry, Sequence, Switch,
    Timeout, MODE_DROP,
};
use spark_flow::error::{CodedError, ErrorCause, Failure};
use spark_flow::{Context, Processor};

fn ctx() -> Context {
    Context::background()
}

fn failing(name: &str) -> Arc<dyn Processor<i32>> {
    Arc::new(Apply::new(name, |_ctx: &Context, _v: &i32| async {
        Err::<i32, ErrorCause>(CodedError::boxed("test.fail", "nope"))
    }))
}

#[tokio::test]
async fn sequence_fails_fast_and_skips_remaining_stages() {
    let ran_after_failure = Arc::new(AtomicUsize::new(0));
    let ran_after_failure2 = ran_after_failure.clone();

    let pipeline = Sequence::new(
        "ingest",
        vec![
            Arc::new(Transform::new("parse", |_ctx: &Context, v: &i32| {
                let v = *v;
                async move { v + 1 }
            })) as Arc<dyn Processor<i32>>,
            failing("validate"),
            Arc::new(Effect::new("persist", move |_ctx: &Context, _v: &i32| {
                ran_after_failure2.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })),
        ],
    );

    let err = pipeline.process(&ctx(), 1).await.unwrap_err();
    assert_eq!(err.path, vec!["ingest".to_string(), "validate".to_string()]);
    assert_eq!(ran_after_failure.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn retry_inside_fallback_recovers_after_retry_is_exhausted() {
    let attempts = Arc::new(AtomicUsize::new(0));

    let primary: Arc<dyn Processor<i32>> = {
        let attempts = attempts.clone();
        Arc::new(Apply::new("primary", move |_ctx: &Context, _v: &i32| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, ErrorCause>(CodedError::boxed("test.down", "primary down")) }
        }))
    };
    let retry: Arc<dyn Processor<i32>> = Arc::new(Retry::new("retry-primary", primary, 2));
    let secondary: Arc<dyn Processor<i32>> = Arc::new(Transform::new("secondary", |_ctx: &Context, v: &i32| {
        let v = *v;
        async move { v * 100 }
    }));

    let fallback = Fallback::new("gateway", vec![retry, secondary]);
    let out = fallback.process(&ctx(), 3).await.unwrap();
    assert_eq!(out, 300);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn timeout_fires_before_a_slow_child_completes() {
    let child: Arc<dyn Processor<i32>> = Arc::new(Transform::new("slow", |_ctx: &Context, v: &i32| {
        let v = *v;
        async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            v
        }
    }));
    let clock = Arc::new(TestClock::new());
    let timeout = Timeout::new("bounded", child, Duration::from_millis(10));
    timeout.with_clock(clock.clone());

    let mut run = tokio::spawn(async move { timeout.process(&Context::background(), 5).await });
    let err = loop {
        tokio::select! {
            res = &mut run => break res.unwrap().unwrap_err(),
            _ = clock.block_until_ready() => {
                clock.advance(Duration::from_secs(3600));
            }
        }
    };
    assert!(err.is_timeout());
    assert_eq!(err.input_data, 5);
}

#[tokio::test]
async fn race_first_success_wins_across_mixed_outcomes() {
    let fast: Arc<dyn Processor<i32>> = Arc::new(Transform::new("fast", |_ctx: &Context, v: &i32| {
        let v = *v;
        async move { v * 2 }
    }));
    let race = Race::new("race", vec![failing("dead-replica"), fast]);
    let out = race.process(&ctx(), 21).await.unwrap();
    assert_eq!(out, 42);
}

#[tokio::test]
async fn contest_waits_for_a_result_meeting_the_condition() {
    let low: Arc<dyn Processor<i32>> = Arc::new(Transform::new("cache", |_ctx: &Context, v: &i32| {
        let v = *v;
        async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            v
        }
    }));
    let high: Arc<dyn Processor<i32>> = Arc::new(Transform::new("fresh", |_ctx: &Context, v: &i32| {
        let v = *v;
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            v * 1000
        }
    }));
    let contest = Contest::new("freshness", |_ctx: &Context, v: &i32| *v > 100, vec![low, high]);
    let out = contest.process(&ctx(), 5).await.unwrap();
    assert_eq!(out, 5000);
}

#[tokio::test]
async fn fallback_exhaustion_surfaces_the_last_candidates_failure() {
    let fallback = Fallback::new("gateway", vec![failing("primary"), failing("secondary")]);
    let err = fallback.process(&ctx(), 9).await.unwrap_err();
    assert_eq!(err.path, vec!["gateway".to_string(), "secondary".to_string()]);
    assert_eq!(err.input_data, 9);
}

#[tokio::test]
async fn rate_limiter_gates_a_downstream_sequence() {
    let downstream_calls = Arc::new(AtomicUsize::new(0));
    let downstream_calls2 = downstream_calls.clone();
    let limiter: Arc<dyn Processor<i32>> = Arc::new(RateLimiter::new("gate", 1.0, 1, MODE_DROP));
    let downstream: Arc<dyn Processor<i32>> = Arc::new(Effect::new("work", move |_ctx: &Context, _v: &i32| {
        downstream_calls2.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    }));
    let gated = Sequence::new("gated-pipeline", vec![limiter, downstream]);

    assert!(gated.process(&ctx(), 1).await.is_ok());
    let err = gated.process(&ctx(), 1).await.unwrap_err();
    assert!(err.to_string().contains("rate limit exceeded"));
    assert_eq!(downstream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handle_observes_a_failure_without_masking_it() {
    let observed_code = Arc::new(std::sync::Mutex::new(String::new()));
    let observed_code2 = observed_code.clone();

    let data: Arc<dyn Processor<i32>> = failing("charge-card");
    let observer: Arc<dyn Processor<Failure<i32>>> = Arc::new(Effect::new(
        "alert-on-call",
        move |_ctx: &Context, failure: &Failure<i32>| {
            *observed_code2.lock().unwrap() = failure.to_string();
            async { Ok(()) }
        },
    ));
    let handled = Handle::new("billing", data, observer);

    let err = handled.process(&ctx(), 42).await.unwrap_err();
    assert_eq!(err.path, vec!["billing".to_string(), "charge-card".to_string()]);
    assert_eq!(err.input_data, 42);
    assert!(!observed_code.lock().unwrap().is_empty());
}

#[tokio::test]
async fn backoff_waits_longer_between_successive_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let child: Arc<dyn Processor<i32>> = Arc::new(Apply::new("unstable", move |_ctx: &Context, _v: &i32| {
        let n = calls2.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n >= 3 {
                Ok(99)
            } else {
                Err(CodedError::boxed("test.unstable", "not ready"))
            }
        }
    }));
    let clock = Arc::new(TestClock::new());
    let backoff = Backoff::new("backoff", child, 5, Duration::from_millis(10)).with_clock(clock.clone());

    let mut run = tokio::spawn(async move { backoff.process(&Context::background(), 1).await });
    let out = loop {
        tokio::select! {
            res = &mut run => break res.unwrap().unwrap(),
            _ = clock.block_until_ready() => {
                clock.advance(Duration::from_secs(3600));
            }
        }
    };
    assert_eq!(out, 99);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn concurrent_runs_every_child_and_keeps_the_original_value() {
    let touched = Arc::new(AtomicUsize::new(0));
    let a = {
        let touched = touched.clone();
        Arc::new(Effect::new("audit-a", move |_ctx: &Context, _v: &i32| {
            touched.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })) as Arc<dyn Processor<i32>>
    };
    let b = {
        let touched = touched.clone();
        Arc::new(Effect::new("audit-b", move |_ctx: &Context, _v: &i32| {
            touched.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })) as Arc<dyn Processor<i32>>
    };
    let concurrent = Concurrent::new("audit-fanout", vec![a, b]);
    let out = concurrent.process(&ctx(), 7).await.unwrap();
    assert_eq!(out, 7);
    assert_eq!(touched.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn switch_routes_by_computed_key_inside_a_larger_pipeline() {
    let normalize: Arc<dyn Processor<i32>> = Arc::new(Transform::new("normalize", |_ctx: &Context, v: &i32| {
        let v = v.abs();
        async move { v }
    }));
    let router: Arc<dyn Processor<i32>> = {
        let sw = Switch::new("route-by-parity", |_ctx: &Context, v: &i32| v % 2 == 0);
        sw.add_route(
            true,
            Arc::new(Transform::new("even-path", |_ctx: &Context, v: &i32| {
                let v = *v;
                async move { v * 10 }
            })),
        );
        sw.add_route(
            false,
            Arc::new(Transform::new("odd-path", |_ctx: &Context, v: &i32| {
                let v = *v;
                async move { v + 1 }
            })),
        );
        Arc::new(sw)
    };
    let pipeline = Sequence::new("normalize-then-route", vec![normalize, router]);

    assert_eq!(pipeline.process(&ctx(), -4).await.unwrap(), 40);
    assert_eq!(pipeline.process(&ctx(), -3).await.unwrap(), 4);
}

#[tokio::test]
async fn closing_a_composed_pipeline_is_idempotent() {
    let pipeline = Sequence::new(
        "composed",
        vec![
            Arc::new(Fallback::new("fb", vec![failing("a"), failing("b")])) as Arc<dyn Processor<i32>>,
        ],
    );
    assert!(pipeline.close().is_ok());
    assert!(pipeline.close().is_ok());
}
