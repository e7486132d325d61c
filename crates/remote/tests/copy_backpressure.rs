//! Tests for bulk-copy streaming and its flush-threshold backpressure.

use lattice_common::{InterruptSignal, Supervisor, SupervisorGuard};
use lattice_engine::MockWorker;
use lattice_protocol::ResultStatus;
use lattice_remote::{Connection, Dispatcher, RemoteCommandSettings};

async fn connect(worker: &MockWorker) -> Connection {
    Connection::connect(worker.host(), worker.port(), "lattice", 1)
        .await
        .unwrap()
}

fn copy_dispatcher(flush_threshold: u64) -> (SupervisorGuard, Dispatcher) {
    let (guard, supervisor) = Supervisor::new();
    let settings = RemoteCommandSettings {
        copy_flush_threshold: flush_threshold,
        ..RemoteCommandSettings::default()
    };
    let dispatcher = Dispatcher::new(settings, InterruptSignal::new(), supervisor);
    (guard, dispatcher)
}

/// Start a copy-in cycle and consume the copy-in handshake result.
async fn begin_copy(dispatcher: &Dispatcher, connection: &mut Connection) {
    dispatcher
        .send_command(connection, "COPY items FROM STDIN")
        .unwrap();
    let result = dispatcher
        .get_result(connection, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ResultStatus::CopyIn);
}

#[tokio::test]
async fn test_writes_below_threshold_accumulate() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, dispatcher) = copy_dispatcher(1024);
    let mut connection = connect(&worker).await;

    begin_copy(&dispatcher, &mut connection).await;

    dispatcher
        .put_copy_data(&mut connection, &[b'a'; 400])
        .await
        .unwrap();
    assert_eq!(connection.copy_bytes_since_flush(), 400);

    dispatcher
        .put_copy_data(&mut connection, &[b'b'; 400])
        .await
        .unwrap();
    assert_eq!(connection.copy_bytes_since_flush(), 800);

    dispatcher.put_copy_end(&mut connection, None).await.unwrap();
    let result = dispatcher
        .get_result(&mut connection, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.command_tag.as_deref(), Some("COPY 2"));
    dispatcher.forget_results(&mut connection).await.unwrap();

    assert_eq!(worker.copied_bytes(), 800);
}

#[tokio::test]
async fn test_crossing_threshold_flushes_and_resets_counter() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, dispatcher) = copy_dispatcher(8192);
    let mut connection = connect(&worker).await;

    begin_copy(&dispatcher, &mut connection).await;

    // one byte past the threshold forces a full flush-and-wait
    dispatcher
        .put_copy_data(&mut connection, &vec![b'x'; 8193])
        .await
        .unwrap();
    assert_eq!(connection.copy_bytes_since_flush(), 0);

    // small writes after the reset accumulate again without flushing
    dispatcher
        .put_copy_data(&mut connection, &[b'y'; 100])
        .await
        .unwrap();
    assert_eq!(connection.copy_bytes_since_flush(), 100);

    dispatcher.put_copy_end(&mut connection, None).await.unwrap();
    let result = dispatcher
        .get_result(&mut connection, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.command_tag.as_deref(), Some("COPY 2"));
    dispatcher.forget_results(&mut connection).await.unwrap();

    assert_eq!(worker.copied_bytes(), 8293);
}

#[tokio::test]
async fn test_copy_fail_aborts_the_stream() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, dispatcher) = copy_dispatcher(1024);
    let mut connection = connect(&worker).await;

    begin_copy(&dispatcher, &mut connection).await;
    dispatcher
        .put_copy_data(&mut connection, b"partial row")
        .await
        .unwrap();

    dispatcher
        .put_copy_end(&mut connection, Some("malformed input"))
        .await
        .unwrap();

    let result = dispatcher
        .get_result(&mut connection, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ResultStatus::Error);
    let fields = result.error.unwrap();
    assert_eq!(fields.sqlstate.as_deref(), Some("57014"));
    assert!(fields.message.unwrap().contains("malformed input"));
}

#[tokio::test]
async fn test_clear_results_terminates_copy_in() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, dispatcher) = copy_dispatcher(1024);
    let mut connection = connect(&worker).await;

    dispatcher
        .send_command(&mut connection, "COPY items FROM STDIN")
        .unwrap();

    // draining hits the copy-in response, terminates the stream, and keeps
    // going until the final result arrives
    let success = dispatcher.clear_results(&mut connection, false).await.unwrap();
    assert!(!success);
    assert!(connection.transaction_failed());

    assert!(
        dispatcher
            .get_result(&mut connection, true)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_clear_results_if_ready_refuses_copy() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, dispatcher) = copy_dispatcher(1024);
    let mut connection = connect(&worker).await;

    begin_copy(&dispatcher, &mut connection).await;

    // a copy in progress cannot be cleared without blocking
    assert!(!dispatcher.clear_results_if_ready(&mut connection));

    dispatcher.put_copy_end(&mut connection, None).await.unwrap();
    dispatcher.forget_results(&mut connection).await.unwrap();
}

#[tokio::test]
async fn test_clear_results_if_ready_drains_buffered_results() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, dispatcher) = copy_dispatcher(1024);
    let mut connection = connect(&worker).await;

    dispatcher.send_command(&mut connection, "SELECT 1").unwrap();

    // give the response time to arrive in the socket buffer
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(dispatcher.clear_results_if_ready(&mut connection));

    // a still-running command cannot be drained without blocking
    dispatcher
        .send_command(&mut connection, "WAITPOINT 'held'")
        .unwrap();
    assert!(!dispatcher.clear_results_if_ready(&mut connection));

    worker.release_waitpoint("held");
    dispatcher.forget_results(&mut connection).await.unwrap();
}
