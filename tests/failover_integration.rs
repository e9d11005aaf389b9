//! Failure-path tests: failover with exclusion, circuit breaker opening
//! and recovery, capability routing, and manual failover.

mod common;

use common::{MockMcpServer, Mode};
use ragmux::{
    BreakerState, EventKind, InstantSleeper, Multiplexer, MuxConfig, MuxError, RagRequest,
    ServerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn start_mux_instant_sleeps(
    config: MuxConfig,
    servers: Vec<ServerConfig>,
) -> Arc<Multiplexer> {
    let mux =
        Arc::new(Multiplexer::with_sleeper(config, Arc::new(InstantSleeper)).unwrap());
    mux.initialize(servers).await.unwrap();
    mux
}

/// Two healthy-looking servers; ids sorted so selection tie-breaks are
/// predictable. Returns `(first_pick, second)`.
async fn ordered_pair() -> (MockMcpServer, MockMcpServer) {
    let x = MockMcpServer::spawn().await;
    let y = MockMcpServer::spawn().await;
    if x.id() < y.id() {
        (x, y)
    } else {
        (y, x)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failover_retries_on_the_healthy_peer() {
    let (first, second) = ordered_pair().await;
    first.set_mode(Mode::QueryReset);

    let mux = start_mux_instant_sleeps(
        MuxConfig::testing(),
        vec![first.config(&[]), second.config(&[])],
    )
    .await;

    let failovers = Arc::new(AtomicUsize::new(0));
    {
        let failovers = Arc::clone(&failovers);
        mux.subscribe(
            EventKind::FailoverTriggered,
            Arc::new(move |_| {
                failovers.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    }

    let response = mux.execute(RagRequest::new("alpha")).await.unwrap();
    assert_eq!(response.metadata.server_id, second.id());
    assert_eq!(first.query_count(), 1, "first pick saw the failing attempt");
    assert_eq!(second.query_count(), 1);

    // The failover ledger names both ends of the switch.
    let history = mux.failover_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_server, first.id());
    assert_eq!(history[0].to_server.as_deref(), Some(second.id().as_str()));
    assert!(history[0].success);
    assert_eq!(failovers.load(Ordering::SeqCst), 1);

    // One transport failure is on the first server's ledger.
    let dashboard = mux.health_dashboard();
    let (_, stats) = dashboard.iter().find(|(id, _)| *id == first.id()).unwrap();
    assert_eq!(stats.failure_count, 1);

    mux.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn breaker_opens_then_recovers() {
    let server = MockMcpServer::spawn().await;
    let mux =
        start_mux_instant_sleeps(MuxConfig::testing(), vec![server.config(&[])]).await;

    // Go completely dark: queries and probes all time out.
    server.set_mode(Mode::Dark);
    let err = mux.execute(RagRequest::new("will fail")).await.unwrap_err();
    assert!(
        err.is_failover_exhausted() || err.is_no_servers() || err.is_timeout(),
        "unexpected error: {err}"
    );

    // Failing probes (1 s cadence, threshold 2) open the breaker shortly.
    let opened_by = Instant::now() + Duration::from_secs(5);
    loop {
        let dashboard = mux.health_dashboard();
        let (_, stats) = dashboard.iter().find(|(id, _)| *id == server.id()).unwrap();
        if stats.state == BreakerState::Open {
            break;
        }
        assert!(Instant::now() < opened_by, "breaker never opened");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // With the only server out, callers fail fast.
    let started = Instant::now();
    let err = mux.execute(RagRequest::new("fails fast")).await.unwrap_err();
    assert!(err.is_no_servers(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_millis(500));

    // Server comes back; the recovery loop resets the breaker and the next
    // probe confirms health.
    server.set_mode(Mode::Ok);
    let recovered_by = Instant::now() + Duration::from_secs(6);
    loop {
        if mux.execute(RagRequest::new("back again")).await.is_ok() {
            break;
        }
        assert!(Instant::now() < recovered_by, "server never recovered");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let dashboard = mux.health_dashboard();
    let (_, stats) = dashboard.iter().find(|(id, _)| *id == server.id()).unwrap();
    assert_eq!(stats.state, BreakerState::Closed);

    mux.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn capability_routing_steers_graph_queries() {
    let vector = MockMcpServer::spawn().await;
    let graph = MockMcpServer::spawn().await;
    let mux = start_mux_instant_sleeps(
        MuxConfig::testing(),
        vec![vector.config(&["vector_search"]), graph.config(&["graph_query"])],
    )
    .await;

    let response = mux
        .execute(RagRequest::new("find related graph nodes"))
        .await
        .unwrap();
    assert_eq!(response.metadata.server_id, graph.id());
    assert_eq!(vector.query_count(), 0);
    assert_eq!(graph.query_count(), 1);

    mux.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn capability_fallback_when_the_capable_server_is_out() {
    let vector = MockMcpServer::spawn().await;
    let graph = MockMcpServer::spawn().await;
    let mux = start_mux_instant_sleeps(
        MuxConfig::testing(),
        vec![vector.config(&["vector_search"]), graph.config(&["graph_query"])],
    )
    .await;

    // Take the graph server out; the router falls back to the remaining
    // eligible server even though it lacks the capability.
    mux.force_failover(&graph.id(), "maintenance").unwrap();
    let response = mux
        .execute(RagRequest::new("find related graph nodes"))
        .await
        .unwrap();
    assert_eq!(response.metadata.server_id, vector.id());
    assert_eq!(graph.query_count(), 0);

    mux.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_failover_is_recorded() {
    let server = MockMcpServer::spawn().await;
    let mux =
        start_mux_instant_sleeps(MuxConfig::testing(), vec![server.config(&[])]).await;

    mux.force_failover(&server.id(), "maintenance").unwrap();

    let history = mux.failover_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_server, server.id());
    assert!(history[0].to_server.is_none());

    let dashboard = mux.health_dashboard();
    let (_, stats) = dashboard.iter().find(|(id, _)| *id == server.id()).unwrap();
    assert_eq!(stats.state, BreakerState::Open);

    mux.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn application_errors_do_not_poison_health() {
    let server = MockMcpServer::spawn().await;
    let mux =
        start_mux_instant_sleeps(MuxConfig::testing(), vec![server.config(&[])]).await;

    server.set_mode(Mode::QueryError("no match".into()));
    let err = mux.execute(RagRequest::new("alpha")).await.unwrap_err();
    assert!(matches!(err, MuxError::Application { .. }));
    assert_eq!(server.query_count(), 1, "application errors are not retried");

    // The backend answered; health-wise that attempt was a success.
    let dashboard = mux.health_dashboard();
    let (_, stats) = dashboard.iter().find(|(id, _)| *id == server.id()).unwrap();
    assert_eq!(stats.state, BreakerState::Closed);
    assert_eq!(stats.failure_count, 0);

    // And the pool recovers instantly once the backend behaves.
    server.set_mode(Mode::Ok);
    mux.execute(RagRequest::new("alpha")).await.unwrap();

    mux.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_failover_carries_the_history() {
    let (first, second) = ordered_pair().await;
    first.set_mode(Mode::QueryReset);
    second.set_mode(Mode::QueryReset);

    let mut config = MuxConfig::testing();
    config.pool.retry_policy.max_retries = 0;
    let mux = start_mux_instant_sleeps(
        config,
        vec![first.config(&[]), second.config(&[])],
    )
    .await;

    let err = mux.execute(RagRequest::new("alpha")).await.unwrap_err();
    let history = err.routing_history().expect("exhaustion carries routing history");
    assert!(history.len() >= 2, "both servers were tried: {history:?}");
    assert!(history.iter().all(|a| !a.success));

    mux.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_servers_fails_fast() {
    let mux = start_mux_instant_sleeps(MuxConfig::testing(), vec![]).await;

    let started = Instant::now();
    let err = mux.execute(RagRequest::new("alpha")).await.unwrap_err();
    assert!(err.is_no_servers());
    assert!(started.elapsed() < Duration::from_millis(500));

    mux.shutdown().await;
}
