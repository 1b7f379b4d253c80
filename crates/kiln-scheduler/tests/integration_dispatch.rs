//! Integration tests for job dispatch.

mod common;

use common::{fixtures::WorkerBuilder, recv, recv_message, TestScheduler};
use kiln_proto::{Assignment, CompileRequest, ConfigurationChange, MonitorEvent, SchedulerMessage};
use kiln_scheduler::{Outbound, Peer};
use tokio::sync::mpsc;

async fn assignment(rx: &mut mpsc::Receiver<Outbound>) -> Assignment {
    match recv_message(rx).await {
        SchedulerMessage::Assignment(assignment) => assignment,
        other => panic!("expected assignment, got {other:?}"),
    }
}

#[tokio::test]
async fn job_goes_to_worker_holding_environment() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain").await;

    let _without = scheduler.connect_worker(WorkerBuilder::new("10.0.0.1").build()).await;
    let _with = scheduler
        .connect_worker(
            WorkerBuilder::new("10.0.0.2")
                .with_hostname("b2.local")
                .with_environments(&["h1"])
                .build(),
        )
        .await;

    let (_peer, mut rx) = scheduler
        .request(CompileRequest::new("h1").with_source_file("main.cpp"))
        .await;
    let assigned = assignment(&mut rx).await;

    assert_eq!(assigned.id, Some(1));
    assert_eq!(assigned.ip.as_deref(), Some("10.0.0.2"));
    assert_eq!(assigned.port, Some(8096));
    assert_eq!(assigned.hostname.as_deref(), Some("b2.local"));
    assert_eq!(scheduler.handle.cluster_info().await.unwrap().active_jobs, 1);
}

#[tokio::test]
async fn no_eligible_worker_gets_empty_assignment() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain").await;

    let (_peer, mut rx) = scheduler.request(CompileRequest::new("h1")).await;
    let assigned = assignment(&mut rx).await;

    assert!(!assigned.is_assigned());
    assert_eq!(scheduler.handle.cluster_info().await.unwrap().active_jobs, 0);
}

#[tokio::test]
async fn equal_scores_go_to_least_recently_used_worker() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain").await;
    let mut workers = Vec::new();
    for ip in ["10.0.0.1", "10.0.0.2"] {
        workers.push(
            scheduler
                .connect_worker(WorkerBuilder::new(ip).with_environments(&["h1"]).build())
                .await,
        );
    }

    let (first, mut rx) = scheduler.request(CompileRequest::new("h1")).await;
    let first_worker = assignment(&mut rx).await.ip.unwrap();
    scheduler.handle.requester_disconnected(first.id).await.unwrap();

    let (_second, mut rx) = scheduler.request(CompileRequest::new("h1")).await;
    let second_worker = assignment(&mut rx).await.ip.unwrap();

    assert_ne!(first_worker, second_worker);
}

#[tokio::test]
async fn affinity_wins_over_spare_capacity() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain").await;
    let _big = scheduler
        .connect_worker(WorkerBuilder::new("10.0.0.1").with_slots(16).with_environments(&["h1"]).build())
        .await;
    let _small = scheduler
        .connect_worker(
            WorkerBuilder::new("10.0.0.2")
                .with_slots(1)
                .with_name("pinned")
                .with_environments(&["h1"])
                .build(),
        )
        .await;

    let (_peer, mut rx) = scheduler.request(CompileRequest::new("h1").with_affinity("pinned")).await;
    assert_eq!(assignment(&mut rx).await.ip.as_deref(), Some("10.0.0.2"));
}

#[tokio::test]
async fn compatible_environment_widens_candidates() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain one").await;
    scheduler.upload("h2", b"toolchain two").await;
    scheduler
        .handle
        .write_configuration(ConfigurationChange {
            field: "compatibleHash".into(),
            add: Some(vec!["h1".into(), "h2".into()]),
            remove: None,
        })
        .await
        .unwrap();

    let _worker = scheduler
        .connect_worker(WorkerBuilder::new("10.0.0.7").with_environments(&["h2"]).build())
        .await;

    let (_peer, mut rx) = scheduler.request(CompileRequest::new("h1")).await;
    assert_eq!(assignment(&mut rx).await.ip.as_deref(), Some("10.0.0.7"));
}

#[tokio::test]
async fn release_is_idempotent() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain").await;
    let _worker = scheduler
        .connect_worker(WorkerBuilder::new("10.0.0.1").with_slots(1).with_environments(&["h1"]).build())
        .await;

    let (peer, mut rx) = scheduler.request(CompileRequest::new("h1")).await;
    assert!(assignment(&mut rx).await.is_assigned());
    assert_eq!(scheduler.handle.list_workers().await.unwrap()[0].active_clients, 1);

    scheduler.handle.requester_disconnected(peer.id).await.unwrap();
    scheduler.handle.requester_disconnected(peer.id).await.unwrap();

    let workers = scheduler.handle.list_workers().await.unwrap();
    assert_eq!(workers[0].active_clients, 0);
    assert_eq!(workers[0].jobs_scheduled, 1);
    assert_eq!(scheduler.handle.cluster_info().await.unwrap().active_jobs, 0);
}

#[tokio::test]
async fn keepalive_flag_is_raised_once_per_window() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain").await;
    let _worker = scheduler
        .connect_worker(WorkerBuilder::new("10.0.0.1").with_environments(&["h1"]).build())
        .await;

    let (_a, mut rx_a) = scheduler.request(CompileRequest::new("h1")).await;
    assert!(assignment(&mut rx_a).await.maintain_semaphores);

    let (_b, mut rx_b) = scheduler.request(CompileRequest::new("h1")).await;
    assert!(!assignment(&mut rx_b).await.maintain_semaphores);
}

#[tokio::test]
async fn job_ids_increase_across_requests() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain").await;
    let _worker = scheduler
        .connect_worker(WorkerBuilder::new("10.0.0.1").with_slots(8).with_environments(&["h1"]).build())
        .await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let (_peer, mut rx) = scheduler.request(CompileRequest::new("h1")).await;
        ids.push(assignment(&mut rx).await.id.unwrap());
    }
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn monitors_see_job_started() {
    let scheduler = TestScheduler::start().await;
    scheduler.upload("h1", b"toolchain").await;
    let _worker = scheduler
        .connect_worker(
            WorkerBuilder::new("10.0.0.1")
                .with_name("builder")
                .with_environments(&["h1"])
                .build(),
        )
        .await;

    let (monitor, mut events) = Peer::channel(16);
    scheduler.handle.monitor_connected(monitor).await.unwrap();
    assert!(matches!(
        recv(&mut events).await,
        Outbound::Monitor(MonitorEvent::WorkerAdded(_))
    ));

    let mut request = CompileRequest::new("h1").with_source_file("lib.cpp");
    request.client_name = Some("dev".into());
    let (_peer, mut rx) = scheduler.request(request).await;
    let assigned = assignment(&mut rx).await;

    match recv(&mut events).await {
        Outbound::Monitor(MonitorEvent::JobStarted(started)) => {
            assert_eq!(Some(started.id), assigned.id);
            assert_eq!(started.client.ip, common::CLIENT_IP.to_string());
            assert_eq!(started.client.name.as_deref(), Some("dev"));
            assert_eq!(started.source_file.as_deref(), Some("lib.cpp"));
            assert_eq!(started.worker.name.as_deref(), Some("builder"));
        }
        other => panic!("expected jobStarted, got {other:?}"),
    }
}
