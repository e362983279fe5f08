mod support;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use quarry_common::{ActorId, NodeId, StatusCode, TxId};
use quarry_executer::messages::{ChannelData, ComputeActorState, ComputeState};
use quarry_executer::services::Timer;
use quarry_executer::{
    init_tracing, result_stream, spawn_executer, DataStrategy, ExecuterEvent, ExecuterReply,
    ExecuterSettings, TokioTimer, TxRequest,
};
use quarry_graph::{PhysicalStage, PhysicalTx, TxResultSpec, TxType};
use support::*;
use tokio::sync::mpsc;

fn streaming_request() -> TxRequest {
    let tx = PhysicalTx::new(TxType::Compute)
        .with_stage(PhysicalStage::new(vec![1], 1))
        .with_result(TxResultSpec::new(0).streaming(0));
    let mut request = TxRequest::new(TxId(3), ActorId::new(NodeId(1), 77), vec![tx]);
    request.timeout = Some(Duration::from_secs(30));
    request
}

#[tokio::test]
async fn spawned_executer_streams_results_to_the_caller() {
    init_tracing();
    let fakes = Fakes::default();
    *fakes.table_resolver.auto_reply.lock().unwrap() = Some(Vec::new());
    *fakes.transport.auto_start.lock().unwrap() = true;
    let (observer, mut started) = mpsc::unbounded_channel();
    *fakes.transport.observer.lock().unwrap() = Some(observer);

    let timer = Arc::new(TokioTimer::try_current().expect("inside a tokio runtime"));
    let services = fakes.services_with_timer(timer);
    let (sink, mut stream) = result_stream();
    let mut request = streaming_request();
    request.result_stream = Some(sink);

    let (handle, reply) = spawn_executer(
        ActorId::new(EXECUTER_NODE, 1),
        ExecuterSettings::default(),
        services,
        Box::new(DataStrategy),
        request,
    );

    let start = started.recv().await.expect("tasks should be dispatched");
    assert_eq!(start.tasks.len(), 1);
    let task = &start.tasks[0];
    let channel = task
        .channels
        .iter()
        .find(|c| c.dst_task.is_none())
        .expect("the task feeds the result")
        .id;
    let actor = actor_for(EXECUTER_NODE, task.task_id);

    assert!(handle.send(ExecuterEvent::ChannelData(ChannelData {
        channel,
        seq_no: 1,
        sender: actor,
        batch: Some(int_batch(&[10, 20, 30])),
        finished: true,
    })));
    let streamed = stream.next().await.expect("batch should be streamed");
    assert_eq!(streamed.query_result_index, 0);
    assert_eq!(streamed.batch.num_rows(), 3);

    assert!(handle.send(ExecuterEvent::ComputeState(ComputeActorState::new(
        actor,
        task.task_id,
        ComputeState::Finished,
    ))));

    let ExecuterReply::Response(response) = reply.await.expect("executer should reply") else {
        panic!("a finished query replies with a response");
    };
    assert_eq!(response.status, StatusCode::Success);
    assert_eq!(response.results[0].rows, 3);
    assert!(response.results[0].batches.is_empty(), "streamed batches are not buffered");

    handle.join.await.expect("executer task should not panic");
    assert!(stream.next().await.is_none(), "stream closes with the executer");
    assert_eq!(fakes.transport.acks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn tokio_timer_delivers_after_the_delay() {
    let timer = TokioTimer::try_current().expect("inside a tokio runtime");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = tokio::time::Instant::now();
    timer.schedule(Duration::from_millis(20), ExecuterEvent::Deadline, tx);

    let event = rx.recv().await.expect("event should be delivered");
    assert_eq!(event.name(), "Deadline");
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn tracing_can_be_initialized_twice() {
    init_tracing();
    init_tracing();
}
