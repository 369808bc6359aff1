//! Full-stack lifecycle tests: deploy → start → drive to completion through
//! `ControlApi`, the same facade the process entry point hosts.

use std::sync::Arc;

use bpmn_graph_core::handlers::Handler;
use bpmn_graph_core::types::{InstanceStatus, UserTaskStatus, VarValue, Variables};
use bpmn_graph_core::{ControlApi, EngineConfig, GraphStore, HandlerRegistry, OxigraphStore};

fn api() -> ControlApi {
    let store: Arc<dyn GraphStore> = Arc::new(OxigraphStore::open_memory().unwrap());
    ControlApi::new(store, HandlerRegistry::new(), Arc::new(EngineConfig::default()))
}

/// Seed scenario S1: linear service task doubling `x`, start with {x:21},
/// expect COMPLETED with {x:42}.
const LINEAR_SERVICE_TASK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="linear">
    <startEvent id="start" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="double" />
    <serviceTask id="double">
      <extensionElements><taskDefinition type="double" /></extensionElements>
    </serviceTask>
    <sequenceFlow id="f2" sourceRef="double" targetRef="end" />
    <endEvent id="end" />
  </process>
</definitions>"#;

const USER_TASK_PROCESS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="approval">
    <startEvent id="start" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="review" />
    <userTask id="review" />
    <sequenceFlow id="f2" sourceRef="review" targetRef="end" />
    <endEvent id="end" />
  </process>
</definitions>"#;

#[tokio::test]
async fn s1_linear_service_task_doubles_x_and_completes() {
    let api = api();
    api.register_topic(
        "double",
        Handler::Function(Arc::new(|mut vars: Variables| {
            Box::pin(async move {
                if let Some(VarValue::Integer(x)) = vars.get("x").cloned() {
                    vars.insert("x".to_string(), VarValue::Integer(x * 2));
                }
                Ok(vars)
            })
        })),
    );
    api.deploy_definition("linear", LINEAR_SERVICE_TASK)
        .await
        .unwrap();

    let mut initial = Variables::new();
    initial.insert("x".to_string(), VarValue::Integer(21));
    let (instance_id, snapshot) = api
        .start_instance("linear", None, initial, None)
        .await
        .unwrap();

    let x = snapshot.iter().find(|v| v.name == "x").unwrap();
    assert_eq!(x.value, serde_json::json!(42));

    let view = api.get_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(view.status, InstanceStatus::Completed);
    assert!(view.current_nodes.is_empty());

    let history = api.history(instance_id).await.unwrap();
    assert!(history.len() >= 4, "expected at least START/TAKE/COMPLETE/END events, got {history:?}");
}

#[tokio::test]
async fn user_task_parks_until_claimed_and_completed() {
    let api = api();
    api.deploy_definition("approval", USER_TASK_PROCESS)
        .await
        .unwrap();

    let (instance_id, _) = api
        .start_instance("approval", None, Variables::new(), None)
        .await
        .unwrap();

    let view = api.get_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(view.status, InstanceStatus::Waiting);
    assert_eq!(view.current_nodes, vec!["review".to_string()]);

    let tasks = api.list_tasks(Some(instance_id)).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.status, UserTaskStatus::Created);

    api.claim_task(task.task_id, "alice").await.unwrap();
    let claimed = api.list_tasks(Some(instance_id)).await.unwrap();
    assert_eq!(claimed[0].assignee.as_deref(), Some("alice"));
    assert_eq!(claimed[0].status, UserTaskStatus::Claimed);

    api.complete_task(task.task_id, Variables::new())
        .await
        .unwrap();

    let view = api.get_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(view.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn stop_instance_reaches_a_terminal_status() {
    let api = api();
    api.deploy_definition("approval", USER_TASK_PROCESS)
        .await
        .unwrap();
    let (instance_id, _) = api
        .start_instance("approval", None, Variables::new(), None)
        .await
        .unwrap();

    api.stop_instance(instance_id, "operator requested shutdown")
        .await
        .unwrap();

    let view = api.get_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(view.status, InstanceStatus::Terminated);
    assert!(view.current_nodes.is_empty());
}

#[tokio::test]
async fn retired_definition_rejects_new_instances() {
    let api = api();
    api.deploy_definition("linear", LINEAR_SERVICE_TASK)
        .await
        .unwrap();
    api.retire_definition("linear", 1).await.unwrap();

    let result = api
        .start_instance("linear", None, Variables::new(), None)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn query_graph_is_read_only_and_reflects_deployed_definitions() {
    let api = api();
    api.deploy_definition("linear", LINEAR_SERVICE_TASK)
        .await
        .unwrap();

    let defs = api.list_definitions().await.unwrap();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].0, "linear");
    assert_eq!(defs[0].1, 1);
}
