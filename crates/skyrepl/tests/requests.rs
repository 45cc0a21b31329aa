//! End-to-end request behavior against live worker services.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use common::{spawn_cluster, stub_controller, IO_TIMEOUT};
use skyrepl::proto::{
    self, ProtoStatus, ProtoStatusExt, RequestBody, ResponseFrame, ResponseResult,
};
use skyrepl::request::{RequestExtendedState, RequestOptions};

fn tracked() -> RequestOptions {
    RequestOptions {
        keep_tracking: true,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trips_through_a_worker() {
    let cluster = spawn_cluster(1, &["sky_dr1"], 1).await;
    let request = cluster
        .controller
        .echo("w1", b"ping".to_vec(), 0, tracked(), None, None)
        .unwrap();
    timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
    assert_eq!(request.extended_state(), RequestExtendedState::Success);
    assert_eq!(request.echo_data().unwrap(), b"ping".to_vec());
    assert_eq!(
        cluster.registry.request_state(request.id()).as_deref(),
        Some("FINISHED:SUCCESS")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn tracked_request_polls_until_the_worker_finishes() {
    let cluster = spawn_cluster(1, &["sky_dr1"], 1).await;
    let request = cluster
        .controller
        .echo("w1", b"slow".to_vec(), 300, tracked(), None, None)
        .unwrap();
    timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
    assert_eq!(request.extended_state(), RequestExtendedState::Success);
    assert_eq!(request.echo_data().unwrap(), b"slow".to_vec());
    let performance = request.performance();
    assert!(performance.finish_time >= performance.start_time + 300);
}

#[tokio::test(flavor = "multi_thread")]
async fn untracked_request_finishes_on_the_first_nonterminal_response() {
    let cluster = spawn_cluster(1, &["sky_dr1"], 1).await;
    let request = cluster
        .controller
        .echo(
            "w1",
            b"later".to_vec(),
            60_000,
            RequestOptions::default(),
            None,
            None,
        )
        .unwrap();
    timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
    assert!(matches!(
        request.extended_state(),
        RequestExtendedState::ServerQueued | RequestExtendedState::ServerInProgress
    ));
}

/// Fill the worker's processing pool (size 2) with long echoes so that
/// subsequent submissions stay queued.
async fn occupy_pool(cluster: &common::Cluster, worker: &str) {
    for _ in 0..2 {
        let request = cluster
            .controller
            .echo(
                worker,
                vec![],
                60_000,
                RequestOptions::default(),
                None,
                None,
            )
            .unwrap();
        timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
    }
    common::wait_until("pool tasks to pick up the echoes", || {
        cluster.servers[0].processor().service_info().num_in_progress == 2
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_cancels_a_queued_request() {
    let cluster = spawn_cluster(1, &["sky_dr1"], 1).await;
    occupy_pool(&cluster, "w1").await;

    let queued = cluster
        .controller
        .echo("w1", b"queued".to_vec(), 60_000, tracked(), None, None)
        .unwrap();
    let stop = cluster
        .controller
        .stop_request("w1", queued.id(), RequestOptions::default(), None, None)
        .unwrap();
    timeout(IO_TIMEOUT, stop.await_finished()).await.unwrap();
    assert_eq!(stop.extended_state(), RequestExtendedState::Success);
    let target = stop.target_status().unwrap();
    assert_eq!(target.status, ProtoStatus::Cancelled);

    timeout(IO_TIMEOUT, queued.await_finished()).await.unwrap();
    assert_eq!(queued.extended_state(), RequestExtendedState::ServerCancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn expiration_finishes_a_stuck_request() {
    let cluster = spawn_cluster(1, &["sky_dr1"], 1).await;
    occupy_pool(&cluster, "w1").await;

    let request = cluster
        .controller
        .echo(
            "w1",
            b"stuck".to_vec(),
            60_000,
            RequestOptions {
                keep_tracking: true,
                expiration: Some(Duration::from_millis(300)),
                ..Default::default()
            },
            None,
            None,
        )
        .unwrap();
    timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
    assert_eq!(request.extended_state(), RequestExtendedState::TimeoutExpired);
    assert_eq!(
        cluster.registry.request_state(request.id()).as_deref(),
        Some("FINISHED:TIMEOUT_EXPIRED")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_replication_is_refused_with_the_colliding_id() {
    let cluster = spawn_cluster(2, &["sky_dr1"], 1).await;
    occupy_pool(&cluster, "w1").await;

    let first = cluster
        .controller
        .replicate("w1", "w2", "sky_dr1", 11, RequestOptions::default(), None, None)
        .unwrap();
    timeout(IO_TIMEOUT, first.await_finished()).await.unwrap();
    assert_eq!(first.extended_state(), RequestExtendedState::ServerQueued);

    let second = cluster
        .controller
        .replicate("w1", "w2", "sky_dr1", 11, RequestOptions::default(), None, None)
        .unwrap();
    timeout(IO_TIMEOUT, second.await_finished()).await.unwrap();
    assert_eq!(second.extended_state(), RequestExtendedState::ServerBad);
    assert_eq!(second.server_status_ext(), ProtoStatusExt::Duplicate);
    assert_eq!(second.duplicate_request_id().as_deref(), Some(first.id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn allowed_duplicate_follows_the_colliding_request_to_completion() {
    let cluster = spawn_cluster(2, &["sky_dr1"], 1).await;
    // hold the pool long enough for both submissions to land while queued
    for _ in 0..2 {
        let request = cluster
            .controller
            .echo("w1", vec![], 2_000, RequestOptions::default(), None, None)
            .unwrap();
        timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
    }

    let first = cluster
        .controller
        .replicate("w1", "w2", "sky_dr1", 12, tracked(), None, None)
        .unwrap();
    let second = cluster
        .controller
        .replicate(
            "w1",
            "w2",
            "sky_dr1",
            12,
            RequestOptions {
                keep_tracking: true,
                allow_duplicate: true,
                ..Default::default()
            },
            None,
            None,
        )
        .unwrap();
    timeout(IO_TIMEOUT, first.await_finished()).await.unwrap();
    timeout(IO_TIMEOUT, second.await_finished()).await.unwrap();
    assert_eq!(first.extended_state(), RequestExtendedState::Success);
    assert_eq!(second.extended_state(), RequestExtendedState::Success);
    assert_eq!(second.duplicate_request_id().as_deref(), Some(first.id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_worker_is_refused_before_anything_hits_the_wire() {
    let cluster = spawn_cluster(1, &["sky_dr1"], 1).await;
    assert!(cluster
        .controller
        .echo("nope", vec![], 0, RequestOptions::default(), None, None)
        .is_err());
    assert!(cluster
        .controller
        .replicate("w1", "w1", "sky_dr1", 1, RequestOptions::default(), None, None)
        .is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_burst_of_requests_multiplexes_over_one_connection() {
    let cluster = spawn_cluster(1, &["sky_dr1"], 1).await;
    let mut requests = Vec::new();
    for n in 0..20u8 {
        requests.push(
            cluster
                .controller
                .echo("w1", vec![n], 0, tracked(), None, None)
                .unwrap(),
        );
    }
    for (n, request) in requests.iter().enumerate() {
        timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
        assert_eq!(request.extended_state(), RequestExtendedState::Success);
        assert_eq!(request.echo_data().unwrap(), vec![n as u8]);
    }
    assert_eq!(cluster.controller.messenger().queue_len("w1"), 0);
}

/// Answer every frame on one connection with `Success`, echoing payloads
/// back and recording the ids in arrival order.
async fn serve_echoes(
    listener: &TcpListener,
    seen: &Arc<Mutex<Vec<String>>>,
) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut framed = proto::framed(socket);
    while let Some(Ok(bytes)) = framed.next().await {
        let frame = proto::decode_request(&bytes).unwrap();
        seen.lock().unwrap().push(frame.id.clone());
        let mut response =
            ResponseFrame::bare(&frame.id, ProtoStatus::Success, ProtoStatusExt::None);
        if let RequestBody::Echo { data, .. } = frame.body {
            response.result = ResponseResult::Echo(data);
        }
        if framed
            .send(proto::encode_response(&response).unwrap())
            .await
            .is_err()
        {
            return;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_connection_retries_the_interrupted_request_first() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        // first connection: swallow one frame, then drop without answering
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = proto::framed(socket);
        let bytes = framed.next().await.unwrap().unwrap();
        log.lock().unwrap().push(proto::decode_request(&bytes).unwrap().id);
        drop(framed);
        // second connection: answer everything
        serve_echoes(&listener, &log).await;
    });

    let controller = stub_controller(port);
    let mut requests = Vec::new();
    for n in 0..3u8 {
        requests.push(
            controller
                .echo("w1", vec![n], 0, RequestOptions::default(), None, None)
                .unwrap(),
        );
    }
    for (n, request) in requests.iter().enumerate() {
        timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
        assert_eq!(request.extended_state(), RequestExtendedState::Success);
        assert_eq!(request.echo_data().unwrap(), vec![n as u8]);
    }

    // the interrupted request went out again ahead of the queued ones
    let seen = seen.lock().unwrap().clone();
    let ids: Vec<&str> = requests.iter().map(|r| r.id()).collect();
    assert_eq!(seen, [ids[0], ids[0], ids[1], ids[2]]);
}

#[tokio::test(flavor = "multi_thread")]
async fn tracked_request_rearms_status_polls_until_terminal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = proto::framed(socket);
        while let Some(Ok(bytes)) = framed.next().await {
            let frame = proto::decode_request(&bytes).unwrap();
            // admit the echo as queued, report progress twice, then finish
            let status = match frame.body {
                RequestBody::Status { .. } => {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        ProtoStatus::InProgress
                    } else {
                        ProtoStatus::Success
                    }
                }
                _ => ProtoStatus::Queued,
            };
            let mut response = ResponseFrame::bare(&frame.id, status, ProtoStatusExt::None);
            if status == ProtoStatus::Success {
                response.result = ResponseResult::Echo(b"tracked".to_vec());
            }
            if framed
                .send(proto::encode_response(&response).unwrap())
                .await
                .is_err()
            {
                return;
            }
        }
    });

    let controller = stub_controller(port);
    let request = controller
        .echo("w1", b"tracked".to_vec(), 60_000, tracked(), None, None)
        .unwrap();
    timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
    assert_eq!(request.extended_state(), RequestExtendedState::Success);
    assert_eq!(request.echo_data().unwrap(), b"tracked".to_vec());
    assert_eq!(polls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_notification_fires_exactly_once() {
    let cluster = spawn_cluster(1, &["sky_dr1"], 1).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let request = cluster
        .controller
        .echo(
            "w1",
            b"once".to_vec(),
            60_000,
            tracked(),
            None,
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let racers: Vec<_> = (0..2)
        .map(|_| {
            let request = request.clone();
            tokio::spawn(async move { request.cancel() })
        })
        .collect();
    for racer in racers {
        racer.await.unwrap();
    }
    timeout(IO_TIMEOUT, request.await_finished()).await.unwrap();
    assert_eq!(request.extended_state(), RequestExtendedState::Cancelled);

    common::wait_until("the completion callback to run", || {
        fired.load(Ordering::SeqCst) >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
