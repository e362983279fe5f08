use std::sync::Arc;

use quarry_common::{StageId, TaskId};
use quarry_graph::{
    Connection, GraphError, PhysicalStage, StageInput, TaskMeta, TaskType, TasksGraph,
};

fn shuffle_graph(producers: usize, consumers: usize) -> TasksGraph {
    let mut graph = TasksGraph::new();
    let scan = StageId::new(0, 0);
    let join = StageId::new(0, 1);
    graph.add_stage(scan, PhysicalStage::new(vec![], 1)).unwrap();
    let mut join_plan = PhysicalStage::new(vec![], 1);
    join_plan.inputs.push(StageInput {
        stage: 0,
        output_index: 0,
        connection: Connection::HashShuffle {
            key_columns: vec!["k".into()],
        },
    });
    graph.add_stage(join, join_plan).unwrap();

    let src: Vec<TaskId> = (0..producers)
        .map(|_| graph.add_task(scan).unwrap().id)
        .collect();
    let dst: Vec<TaskId> = (0..consumers)
        .map(|_| graph.add_task(join).unwrap().id)
        .collect();
    for s in &src {
        for d in &dst {
            graph.add_channel(*s, 0, Some(*d), 0).unwrap();
        }
    }
    for d in &dst {
        graph.add_channel(*d, 0, None, 0).unwrap();
    }
    graph
}

#[test]
fn shuffle_graph_keeps_referential_integrity() {
    let graph = shuffle_graph(3, 2);
    graph.validate().expect("graph should be consistent");

    assert_eq!(graph.tasks().len(), 5);
    assert_eq!(graph.channels().len(), 3 * 2 + 2);
    for channel in graph.channels() {
        let src = graph.task(channel.src_task).unwrap();
        assert!(src.outputs[channel.src_output_index].channels.contains(&channel.id));
        if let Some(dst) = channel.dst_task {
            let dst = graph.task(dst).unwrap();
            assert!(dst.inputs[channel.dst_input_index].channels.contains(&channel.id));
        }
    }
}

#[test]
fn glued_tasks_share_one_meta() {
    let mut graph = TasksGraph::new();
    let stage = StageId::new(0, 0);
    graph.add_stage(stage, PhysicalStage::new(vec![], 1)).unwrap();

    let shared = Arc::new(TaskMeta::with_type(TaskType::Scan));
    let ids: Vec<TaskId> = (0..3)
        .map(|_| {
            let task = graph.add_task(stage).unwrap();
            task.set_glued_meta(shared.clone(), 7);
            task.id
        })
        .collect();

    for id in &ids {
        let task = graph.task(*id).unwrap();
        assert_eq!(task.meta_glueing_id(), Some(7));
        assert!(Arc::ptr_eq(&task.shared_meta(), &shared));
    }
    let err = graph.task_mut(ids[1]).unwrap().meta_mut().unwrap_err();
    assert_eq!(err, GraphError::GluedMetaMutation(ids[1]));
}
