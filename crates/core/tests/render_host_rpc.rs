use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::routing::post;
use axum::{Json, Router};
use drawanim_core::config::{RpcConfig, SchedulerConfig};
use drawanim_core::envelope::{Envelope, MessageKind};
use drawanim_core::rpc::{
    render_host_router, FinishStatus, RenderBackend, RenderHostClient, RpcError, StartOutcome,
};
use drawanim_core::scheduler::{Scheduler, Worker, WorkerPool};

/// Worker whose liveness is flipped from the test.
struct SwitchWorker {
    alive: Arc<AtomicBool>,
}

impl Worker for SwitchWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct SwitchPool {
    fail: bool,
    spawned: Mutex<Vec<(String, Arc<AtomicBool>)>>,
}

impl SwitchPool {
    fn exit(&self, index: usize) {
        self.spawned.lock().unwrap()[index].1.store(false, Ordering::SeqCst);
    }
}

struct SharedPool(Arc<SwitchPool>);

impl WorkerPool for SharedPool {
    fn spawn(&self, _job_id: &str, config_path: &str) -> anyhow::Result<Box<dyn Worker>> {
        if self.0.fail {
            anyhow::bail!("render executable missing");
        }
        let alive = Arc::new(AtomicBool::new(true));
        self.0
            .spawned
            .lock()
            .unwrap()
            .push((config_path.to_string(), alive.clone()));
        Ok(Box::new(SwitchWorker { alive }))
    }
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr, call_timeout_ms: u64) -> RenderHostClient {
    RenderHostClient::new(
        &format!("http://{addr}"),
        &RpcConfig {
            call_timeout_ms,
            finish_check_timeout_ms: call_timeout_ms,
        },
    )
    .unwrap()
}

async fn render_host(limits: SchedulerConfig, pool: Arc<SwitchPool>) -> RenderHostClient {
    let scheduler = Arc::new(Scheduler::new(limits, Box::new(SharedPool(pool))));
    let addr = serve(render_host_router(scheduler)).await;
    client(addr, 3000)
}

fn admitted(outcome: StartOutcome) -> (String, Option<usize>) {
    match outcome {
        StartOutcome::Admitted {
            job_id,
            queue_position,
            ..
        } => (job_id, queue_position),
        StartOutcome::Full { text } => panic!("expected admission, got FULL_JOB: {text}"),
    }
}

#[tokio::test]
async fn ping_round_trips_over_http() {
    let host = render_host(SchedulerConfig::default(), Arc::default()).await;
    assert_eq!(host.ping(17).await.unwrap(), 17);
}

#[tokio::test]
async fn single_slot_without_queue_reports_full() {
    let pool = Arc::new(SwitchPool::default());
    let host = render_host(
        SchedulerConfig {
            max_concurrent_jobs: 1,
            max_queue_length: 0,
        },
        pool.clone(),
    )
    .await;

    let (job_a, position) = admitted(host.start_render("a").await.unwrap());
    assert_eq!(position, None);
    assert!(matches!(
        host.start_render("b").await.unwrap(),
        StartOutcome::Full { .. }
    ));

    assert_eq!(host.is_finish_render(&job_a).await.unwrap(), FinishStatus::Running);
    pool.exit(0);
    assert_eq!(host.is_finish_render(&job_a).await.unwrap(), FinishStatus::Finished);

    // The reaped slot is free again.
    let (_, position) = admitted(host.start_render("c").await.unwrap());
    assert_eq!(position, None);
}

#[tokio::test]
async fn queued_jobs_are_promoted_in_arrival_order() {
    let pool = Arc::new(SwitchPool::default());
    let host = render_host(
        SchedulerConfig {
            max_concurrent_jobs: 1,
            max_queue_length: 2,
        },
        pool.clone(),
    )
    .await;

    let (first, _) = admitted(host.start_render("first").await.unwrap());
    let (second, pos_second) = admitted(host.start_render("second").await.unwrap());
    let (third, pos_third) = admitted(host.start_render("third").await.unwrap());
    assert_eq!((pos_second, pos_third), (Some(1), Some(2)));

    host.cancel_render(&first).await.unwrap();
    assert_eq!(pool.spawned.lock().unwrap()[1].0, "second");
    assert_eq!(host.is_finish_render(&second).await.unwrap(), FinishStatus::Running);
    assert_eq!(host.is_finish_render(&third).await.unwrap(), FinishStatus::Running);

    // Cancelling twice, or an id nobody knows, still answers TERMINATE.
    host.cancel_render(&first).await.unwrap();
    host.cancel_render("no-such-job").await.unwrap();
}

#[tokio::test]
async fn spawn_failure_surfaces_as_remote_error() {
    let pool = Arc::new(SwitchPool {
        fail: true,
        ..SwitchPool::default()
    });
    let host = render_host(SchedulerConfig::default(), pool).await;

    match host.start_render("cfg").await {
        Err(RpcError::Remote {
            status, message, ..
        }) => {
            assert_eq!(status, 500);
            assert!(message.contains("render executable missing"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn silent_host_times_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let err = client(addr, 200).ping(1).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err:?}");
}

#[tokio::test]
async fn unreachable_host_is_a_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(addr, 2000).ping(1).await.unwrap_err();
    assert!(
        matches!(err, RpcError::Connection { method: "ping", .. }),
        "expected connection error, got {err:?}"
    );
}

#[tokio::test]
async fn kinds_outside_the_contract_are_rejected() {
    let router = Router::new().route(
        "/rpc",
        post(|| async { Json(Envelope::complete("done", None)) }),
    );
    let host = client(serve(router).await, 2000);

    match host.start_render("cfg").await {
        Err(RpcError::UnexpectedKind { method, kind }) => {
            assert_eq!(method, "start_render");
            assert_eq!(kind, MessageKind::Complete);
        }
        other => panic!("expected unexpected-kind error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_kinds_fail_closed() {
    let router = Router::new().route(
        "/rpc",
        post(|| async { Json(serde_json::json!({"type": "FINISHED", "message": "ok"})) }),
    );
    let host = client(serve(router).await, 2000);

    let err = host.is_finish_render("job").await.unwrap_err();
    assert!(
        matches!(err, RpcError::Protocol { .. }),
        "expected protocol error, got {err:?}"
    );
}
