//! Tests for the multiplexed wait over many busy connections, including
//! cancellation and supervisor-liveness behavior.

use lattice_common::{InterruptSignal, Supervisor};
use lattice_engine::{MockWorker, ScriptedFailure};
use lattice_protocol::ResultStatus;
use lattice_remote::{
    Abort, Connection, Dispatcher, RemoteCommandSettings, RemoteError, multiplexer,
};
use std::time::Duration;
use tokio::time::sleep;

async fn connect(worker: &MockWorker, connection_id: u64) -> Connection {
    Connection::connect(worker.host(), worker.port(), "lattice", connection_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_returns_only_after_every_connection_completes() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, supervisor) = Supervisor::new();
    let interrupts = InterruptSignal::new();
    let dispatcher = Dispatcher::new(
        RemoteCommandSettings::default(),
        interrupts.clone(),
        supervisor.clone(),
    );

    let mut connections = Vec::new();
    for id in 0..3u64 {
        let mut connection = connect(&worker, id).await;
        dispatcher
            .send_command(&mut connection, &format!("WAITPOINT 'w{}'", id))
            .unwrap();
        connections.push(connection);
    }

    let task = tokio::spawn(async move {
        let outcome =
            multiplexer::wait_for_all(&mut connections, true, &interrupts, &supervisor).await;
        (outcome, connections)
    });

    // out-of-order release; the wait must hold until the last one
    worker.release_waitpoint("w1");
    sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    worker.release_waitpoint("w2");
    sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    worker.release_waitpoint("w0");
    let (outcome, mut connections) = task.await.unwrap();
    outcome.unwrap();

    for connection in &mut connections {
        assert!(!connection.is_busy());
        let result = dispatcher
            .get_result(connection, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.command_tag.as_deref(), Some("WAITPOINT"));
        dispatcher.forget_results(connection).await.unwrap();
        assert!(!connection.transaction_failed());
    }
}

#[tokio::test]
async fn test_failed_connection_counts_as_done() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, supervisor) = Supervisor::new();
    let interrupts = InterruptSignal::new();
    let dispatcher = Dispatcher::new(
        RemoteCommandSettings::default(),
        interrupts.clone(),
        supervisor.clone(),
    );

    // one connection hits a fatal error and loses its socket, the other
    // completes normally; the wait must finish for both
    worker.fail_next_matching(
        ScriptedFailure::new("SELECT broken", "57P01", "terminating connection").fatal(),
    );

    let mut failing = connect(&worker, 1).await;
    let mut healthy = connect(&worker, 2).await;
    dispatcher.send_command(&mut failing, "SELECT broken").unwrap();
    dispatcher.send_command(&mut healthy, "SELECT 1").unwrap();

    let mut connections = vec![failing, healthy];
    multiplexer::wait_for_all(&mut connections, true, &interrupts, &supervisor)
        .await
        .unwrap();

    let result = dispatcher
        .get_result(&mut connections[0], true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ResultStatus::FatalError);

    let result = dispatcher
        .get_result(&mut connections[1], true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ResultStatus::TuplesOk);
}

#[tokio::test]
async fn test_idle_connections_need_no_waiting() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, supervisor) = Supervisor::new();
    let interrupts = InterruptSignal::new();

    let mut connections = vec![connect(&worker, 1).await, connect(&worker, 2).await];
    multiplexer::wait_for_all(&mut connections, true, &interrupts, &supervisor)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancellation_opt_in_aborts_the_wait() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, supervisor) = Supervisor::new();
    let interrupts = InterruptSignal::new();
    let dispatcher = Dispatcher::new(
        RemoteCommandSettings::default(),
        interrupts.clone(),
        supervisor.clone(),
    );

    let mut connection = connect(&worker, 1).await;
    dispatcher
        .send_command(&mut connection, "WAITPOINT 'held'")
        .unwrap();

    let wait_interrupts = interrupts.clone();
    let task = tokio::spawn(async move {
        let mut connections = vec![connection];
        multiplexer::wait_for_all(&mut connections, true, &wait_interrupts, &supervisor).await
    });

    sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    interrupts.request();
    let outcome = task.await.unwrap();
    assert_eq!(outcome, Err(Abort::Interrupted));

    worker.release_waitpoint("held");
}

#[tokio::test]
async fn test_cancellation_opt_out_marks_pending_connections_failed() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, supervisor) = Supervisor::new();
    let interrupts = InterruptSignal::new();
    let dispatcher = Dispatcher::new(
        RemoteCommandSettings::default(),
        interrupts.clone(),
        supervisor.clone(),
    );

    let mut connection = connect(&worker, 1).await;
    dispatcher
        .send_command(&mut connection, "WAITPOINT 'held'")
        .unwrap();

    let wait_interrupts = interrupts.clone();
    let task = tokio::spawn(async move {
        let mut connections = vec![connection];
        let outcome =
            multiplexer::wait_for_all(&mut connections, false, &wait_interrupts, &supervisor)
                .await;
        (outcome, connections)
    });

    sleep(Duration::from_millis(50)).await;
    interrupts.request();

    let (outcome, connections) = task.await.unwrap();
    outcome.unwrap();
    assert!(connections[0].transaction_failed());

    worker.release_waitpoint("held");
}

#[tokio::test]
async fn test_supervisor_exit_aborts_the_wait() {
    let worker = MockWorker::spawn().await.unwrap();
    let (guard, supervisor) = Supervisor::new();
    let interrupts = InterruptSignal::new();
    let dispatcher = Dispatcher::new(
        RemoteCommandSettings::default(),
        interrupts.clone(),
        supervisor.clone(),
    );

    let mut connection = connect(&worker, 1).await;
    dispatcher
        .send_command(&mut connection, "WAITPOINT 'held'")
        .unwrap();

    let task = tokio::spawn(async move {
        let mut connections = vec![connection];
        multiplexer::wait_for_all(&mut connections, true, &interrupts, &supervisor).await
    });

    sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    drop(guard);
    let outcome = task.await.unwrap();
    assert_eq!(outcome, Err(Abort::SupervisorExit));

    worker.release_waitpoint("held");
}

#[tokio::test]
async fn test_get_result_opt_out_interrupt_returns_none() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, supervisor) = Supervisor::new();
    let interrupts = InterruptSignal::new();
    let dispatcher = Dispatcher::new(
        RemoteCommandSettings::default(),
        interrupts.clone(),
        supervisor,
    );

    let mut connection = connect(&worker, 1).await;
    dispatcher
        .send_command(&mut connection, "WAITPOINT 'held'")
        .unwrap();

    let task = tokio::spawn(async move {
        let outcome = dispatcher.get_result(&mut connection, false).await;
        (outcome, connection)
    });

    sleep(Duration::from_millis(50)).await;
    interrupts.request();

    let (outcome, connection) = task.await.unwrap();
    assert!(outcome.unwrap().is_none());
    assert!(connection.transaction_failed());

    worker.release_waitpoint("held");
}

#[tokio::test]
async fn test_get_result_opt_in_interrupt_raises() {
    let worker = MockWorker::spawn().await.unwrap();
    let (_guard, supervisor) = Supervisor::new();
    let interrupts = InterruptSignal::new();
    let dispatcher = Dispatcher::new(
        RemoteCommandSettings::default(),
        interrupts.clone(),
        supervisor,
    );

    let mut connection = connect(&worker, 1).await;
    dispatcher
        .send_command(&mut connection, "WAITPOINT 'held'")
        .unwrap();

    let task = tokio::spawn(async move { dispatcher.get_result(&mut connection, true).await });

    sleep(Duration::from_millis(50)).await;
    interrupts.request();

    let outcome = task.await.unwrap();
    assert!(matches!(
        outcome,
        Err(RemoteError::Aborted(Abort::Interrupted))
    ));

    worker.release_waitpoint("held");
}
