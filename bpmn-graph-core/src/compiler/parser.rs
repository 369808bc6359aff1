//! BPMN 2.0 XML → `ProcessDefinition` compiler front-end (design §4's C14).
//!
//! Grounded on `bpmn-lite-core/src/compiler/parser.rs`: a single-pass
//! `quick_xml` reader dispatching on local (namespace-stripped) tag names,
//! carrying parse state across Start/Empty/Text/End events rather than
//! building a DOM. Extended from its flat element set to the full
//! node-kind table, and generalized from a single top-level process to
//! nested `subProcess` containers tracked with an explicit container-id
//! stack (BPMN nesting is shallow at parse time — children close before
//! their parent does).

use crate::types::{
    CatchDetail, CatchEventTrigger, DefinitionStatus, EndEventKind, ExecutionListener, FlowNode,
    ListenerEvent, MultiInstanceMode, MultiInstanceSpec, NodeKind, ProcessDefinition, SequenceFlow,
};
use anyhow::{anyhow, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashMap;

/// Parse a BPMN 2.0 XML document into a `ProcessDefinition`. `definition_id`
/// and `version` are assigned by the caller (deploy), not read from the XML.
pub fn parse_bpmn(xml: &str, definition_id: &str, version: u32) -> Result<ProcessDefinition> {
    let mut reader = Reader::from_str(xml);
    let mut st = ParseState::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => handle_open(e, false, &mut st)?,
            Ok(Event::Empty(ref e)) => handle_open(e, true, &mut st)?,
            Ok(Event::End(ref e)) => handle_close(&local_name(e.name().as_ref()), &mut st)?,
            Ok(Event::Text(ref e)) => {
                if let Ok(text) = e.unescape() {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        if st.in_condition_expression {
                            st.pending_condition_text = Some(text.clone());
                        }
                        if st.in_timer_child {
                            st.pending_timer_text = Some(text);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("XML parse error: {e}")),
            _ => {}
        }
        buf.clear();
    }

    for (container_id, start_id) in st.subprocess_start.iter() {
        if let Some(&pos) = st.node_index.get(container_id) {
            patch_start_node(&mut st.nodes[pos].kind, start_id);
        }
    }

    for flow in &mut st.flows {
        if st.default_flow_ids.get(&flow.source) == Some(&flow.id) {
            flow.is_default = true;
        }
    }

    if st.nodes.is_empty() {
        return Err(anyhow!("definition has no flow nodes"));
    }

    Ok(ProcessDefinition {
        id: definition_id.to_string(),
        version,
        name: st.process_name.unwrap_or_else(|| definition_id.to_string()),
        status: DefinitionStatus::Active,
        nodes: st.nodes,
        flows: st.flows,
        source_xml: xml.to_string(),
    })
}

fn patch_start_node(kind: &mut NodeKind, start_id: &str) {
    match kind {
        NodeKind::EmbeddedSubprocess { start_node, .. } => *start_node = start_id.to_string(),
        NodeKind::EventSubprocess { start_node, .. } => *start_node = start_id.to_string(),
        _ => {}
    }
}

// ─── Parse state ────────────────────────────────────────────────

#[derive(Default)]
struct ParseState {
    nodes: Vec<FlowNode>,
    node_index: HashMap<String, usize>,
    flows: Vec<SequenceFlow>,
    container_stack: Vec<String>,
    subprocess_start: HashMap<String, String>,
    process_name: Option<String>,
    error_defs: HashMap<String, String>,
    signal_defs: HashMap<String, String>,
    message_defs: HashMap<String, String>,
    /// Gateway/activity id -> its `default="..."` sequence flow id, read
    /// from the element's own attribute (BPMN puts "default" on the
    /// splitting node, not the flow). Applied to `flows` once parsing ends,
    /// since the flow itself may not exist yet when its owner is opened.
    default_flow_ids: HashMap<String, String>,

    current_element: Option<ElementCtx>,
    in_extension_elements: bool,
    in_condition_expression: bool,
    in_timer_child: bool,
    in_multi_instance: bool,

    pending_topic: Option<String>,
    pending_corr_key: Option<String>,
    pending_listeners: Vec<ExecutionListener>,
    pending_condition_text: Option<String>,
    pending_timer_text: Option<String>,
    pending_timer_kind: Option<TimerKind>,
    pending_event_def: Option<EventDefKind>,
    pending_mi_cardinality: Option<String>,
    pending_mi_completion: Option<String>,
    pending_mi_sequential: bool,
    pending_in_vars: Option<Vec<String>>,
    pending_out_vars: Option<Vec<String>>,
}

enum ElementCtx {
    Task { id: String, name: Option<String>, kind: TaskKind },
    CatchOrThrow { id: String, name: Option<String> },
    Boundary { id: String, attached_to: String, cancel_activity: bool },
    Flow { id: String, source: String, target: String },
    Subprocess { id: String, name: Option<String> },
}

#[derive(Clone, Copy)]
enum TaskKind {
    Service,
    Send,
    User,
    Receive,
    Script,
    Manual,
}

enum EventDefKind {
    Message { message_name: String },
    Timer,
    Signal { signal_name: String },
    Error { error_code: Option<String> },
    Escalation,
    Conditional,
    Terminate,
    Cancel,
    Compensation,
}

enum TimerKind {
    Duration,
    Date,
    Cycle,
}

// ─── Tag dispatch ───────────────────────────────────────────────

fn handle_open(e: &BytesStart, is_empty: bool, st: &mut ParseState) -> Result<()> {
    let local = local_name(e.name().as_ref());
    match local.as_str() {
        "process" => {
            st.process_name = get_attr_opt(e, "name");
        }
        "error" => {
            if let (Ok(id), Some(code)) = (get_attr(e, "id"), get_attr_opt(e, "errorCode")) {
                st.error_defs.insert(id, code);
            }
        }
        "signal" => {
            if let (Ok(id), Some(name)) = (get_attr(e, "id"), get_attr_opt(e, "name")) {
                st.signal_defs.insert(id, name);
            }
        }
        "message" => {
            if let (Ok(id), Some(name)) = (get_attr(e, "id"), get_attr_opt(e, "name")) {
                st.message_defs.insert(id, name);
            }
        }
        "subProcess" | "transaction" => {
            let id = get_attr(e, "id")?;
            let name = get_attr_opt(e, "name");
            let triggered_by_event = get_attr_opt(e, "triggeredByEvent")
                .map(|v| v == "true")
                .unwrap_or(false);
            let container = st.container_stack.last().cloned();
            let kind = if triggered_by_event {
                NodeKind::EventSubprocess {
                    start_node: String::new(),
                    interrupting: true,
                }
            } else {
                NodeKind::EmbeddedSubprocess {
                    start_node: String::new(),
                    own_variable_scope: false,
                }
            };
            add_node(
                st,
                FlowNode {
                    id: id.clone(),
                    name,
                    kind,
                    multi_instance: None,
                    listeners: Vec::new(),
                    in_variables: None,
                    out_variables: None,
                    container,
                },
            );
            st.container_stack.push(id);
        }
        "startEvent" => {
            if is_empty {
                finish_start_event(st, get_attr(e, "id")?, get_attr_opt(e, "name"), None);
            } else {
                st.current_element = Some(ElementCtx::CatchOrThrow {
                    id: get_attr(e, "id")?,
                    name: get_attr_opt(e, "name"),
                });
                st.pending_event_def = None;
            }
        }
        "endEvent" => {
            if is_empty {
                finish_end_event(st, get_attr(e, "id")?, get_attr_opt(e, "name"), None);
            } else {
                st.current_element = Some(ElementCtx::CatchOrThrow {
                    id: get_attr(e, "id")?,
                    name: get_attr_opt(e, "name"),
                });
                st.pending_event_def = None;
            }
        }
        "intermediateThrowEvent" => {
            st.current_element = Some(ElementCtx::CatchOrThrow {
                id: get_attr(e, "id")?,
                name: get_attr_opt(e, "name"),
            });
            st.pending_event_def = None;
        }
        "intermediateCatchEvent" => {
            st.current_element = Some(ElementCtx::CatchOrThrow {
                id: get_attr(e, "id")?,
                name: get_attr_opt(e, "name"),
            });
            st.pending_event_def = None;
        }
        "boundaryEvent" => {
            let id = get_attr(e, "id")?;
            let attached_to = get_attr(e, "attachedToRef")?;
            let cancel_activity = get_attr_opt(e, "cancelActivity")
                .map(|v| v != "false")
                .unwrap_or(true);
            st.current_element = Some(ElementCtx::Boundary {
                id,
                attached_to,
                cancel_activity,
            });
            st.pending_event_def = None;
        }
        "messageEventDefinition" => {
            let message_name = get_attr_opt(e, "messageRef")
                .and_then(|r| st.message_defs.get(&r).cloned())
                .unwrap_or_else(|| "unknown".to_string());
            st.pending_event_def = Some(EventDefKind::Message { message_name });
        }
        "timerEventDefinition" => st.pending_event_def = Some(EventDefKind::Timer),
        "signalEventDefinition" => {
            let signal_name = get_attr_opt(e, "signalRef")
                .and_then(|r| st.signal_defs.get(&r).cloned())
                .unwrap_or_else(|| "unknown".to_string());
            st.pending_event_def = Some(EventDefKind::Signal { signal_name });
        }
        "errorEventDefinition" => {
            let error_code = get_attr_opt(e, "errorRef").and_then(|r| st.error_defs.get(&r).cloned());
            st.pending_event_def = Some(EventDefKind::Error { error_code });
        }
        "escalationEventDefinition" => st.pending_event_def = Some(EventDefKind::Escalation),
        "conditionalEventDefinition" => st.pending_event_def = Some(EventDefKind::Conditional),
        "terminateEventDefinition" => st.pending_event_def = Some(EventDefKind::Terminate),
        "cancelEventDefinition" => st.pending_event_def = Some(EventDefKind::Cancel),
        "compensateEventDefinition" => st.pending_event_def = Some(EventDefKind::Compensation),
        "timeDuration" => {
            st.pending_timer_kind = Some(TimerKind::Duration);
            st.in_timer_child = true;
        }
        "timeDate" => {
            st.pending_timer_kind = Some(TimerKind::Date);
            st.in_timer_child = true;
        }
        "timeCycle" => {
            st.pending_timer_kind = Some(TimerKind::Cycle);
            st.in_timer_child = true;
        }
        "serviceTask" | "sendTask" | "userTask" | "receiveTask" | "scriptTask" | "manualTask" => {
            let id = get_attr(e, "id")?;
            let name = get_attr_opt(e, "name");
            let kind = match local.as_str() {
                "serviceTask" => TaskKind::Service,
                "sendTask" => TaskKind::Send,
                "userTask" => TaskKind::User,
                "receiveTask" => TaskKind::Receive,
                "scriptTask" => TaskKind::Script,
                _ => TaskKind::Manual,
            };
            if matches!(kind, TaskKind::Receive) {
                if let Some(msg_ref) = get_attr_opt(e, "messageRef") {
                    st.pending_topic = st.message_defs.get(&msg_ref).cloned();
                }
            }
            if is_empty {
                finish_task(st, id, name, kind);
            } else {
                st.current_element = Some(ElementCtx::Task { id, name, kind });
                if !matches!(kind, TaskKind::Receive) {
                    st.pending_topic = None;
                }
                st.pending_corr_key = None;
                st.pending_listeners.clear();
                st.pending_in_vars = None;
                st.pending_out_vars = None;
            }
        }
        "callActivity" => {
            let id = get_attr(e, "id")?;
            let name = get_attr_opt(e, "name");
            let called_element = get_attr_opt(e, "calledElement").unwrap_or_default();
            if is_empty {
                add_node(
                    st,
                    FlowNode {
                        id,
                        name,
                        kind: NodeKind::CallActivity {
                            called_element,
                            in_variables: None,
                            out_variables: None,
                        },
                        multi_instance: None,
                        listeners: Vec::new(),
                        in_variables: None,
                        out_variables: None,
                        container: st.container_stack.last().cloned(),
                    },
                );
            } else {
                st.current_element = Some(ElementCtx::Subprocess { id, name });
                st.pending_topic = Some(called_element);
                st.pending_in_vars = None;
                st.pending_out_vars = None;
            }
        }
        "exclusiveGateway" => add_simple(st, e, NodeKind::ExclusiveGateway)?,
        "parallelGateway" => add_simple(st, e, NodeKind::ParallelGateway)?,
        "inclusiveGateway" => add_simple(st, e, NodeKind::InclusiveGateway)?,
        "eventBasedGateway" => add_simple(st, e, NodeKind::EventBasedGateway)?,
        "sequenceFlow" => {
            let id = get_attr(e, "id")?;
            let source = get_attr(e, "sourceRef")?;
            let target = get_attr(e, "targetRef")?;
            if is_empty {
                st.flows.push(SequenceFlow {
                    id,
                    source,
                    target,
                    condition: None,
                    is_default: false,
                });
            } else {
                st.current_element = Some(ElementCtx::Flow { id, source, target });
                st.pending_condition_text = None;
            }
        }
        "conditionExpression" => st.in_condition_expression = true,
        "extensionElements" => st.in_extension_elements = true,
        "taskDefinition" if st.in_extension_elements => {
            if let Ok(topic) = get_attr(e, "type") {
                st.pending_topic = Some(topic);
            }
        }
        "subscription" if st.in_extension_elements => {
            if let Ok(ck) = get_attr(e, "correlationKey") {
                st.pending_corr_key = Some(ck.trim_start_matches('=').trim().to_string());
            }
        }
        "executionListener" if st.in_extension_elements => {
            let event = match get_attr_opt(e, "event").as_deref() {
                Some("end") => ListenerEvent::End,
                Some("take") => ListenerEvent::Take,
                _ => ListenerEvent::Start,
            };
            st.pending_listeners.push(ExecutionListener {
                event,
                expression: get_attr_opt(e, "expression"),
                class_or_delegate: get_attr_opt(e, "class"),
            });
        }
        "taskListener" if st.in_extension_elements => {
            let event = match get_attr_opt(e, "event").as_deref() {
                Some("assignment") => ListenerEvent::Assignment,
                Some("complete") => ListenerEvent::Complete,
                _ => ListenerEvent::Create,
            };
            st.pending_listeners.push(ExecutionListener {
                event,
                expression: get_attr_opt(e, "expression"),
                class_or_delegate: get_attr_opt(e, "class"),
            });
        }
        "in" if st.in_extension_elements => {
            if let Ok(name) = get_attr(e, "source") {
                st.pending_in_vars.get_or_insert_with(Vec::new).push(name);
            }
        }
        "out" if st.in_extension_elements => {
            if let Ok(name) = get_attr(e, "target") {
                st.pending_out_vars.get_or_insert_with(Vec::new).push(name);
            }
        }
        "multiInstanceLoopCharacteristics" => {
            st.in_multi_instance = true;
            st.pending_mi_sequential = get_attr_opt(e, "isSequential")
                .map(|v| v == "true")
                .unwrap_or(false);
            st.pending_mi_cardinality = None;
            st.pending_mi_completion = None;
        }
        "loopCardinality" if st.in_multi_instance => st.in_condition_expression = true,
        "completionCondition" if st.in_multi_instance => st.in_timer_child = true,
        _ => {}
    }
    Ok(())
}

fn handle_close(local: &str, st: &mut ParseState) -> Result<()> {
    match local {
        "extensionElements" => st.in_extension_elements = false,
        "conditionExpression" => st.in_condition_expression = false,
        "timeDuration" | "timeDate" | "timeCycle" => st.in_timer_child = false,
        "loopCardinality" => {
            st.in_condition_expression = false;
            st.pending_mi_cardinality = st.pending_condition_text.take();
        }
        "completionCondition" => {
            st.in_timer_child = false;
            st.pending_mi_completion = st.pending_timer_text.take();
        }
        "multiInstanceLoopCharacteristics" => st.in_multi_instance = false,
        "startEvent" => {
            if let Some(ElementCtx::CatchOrThrow { id, name }) = st.current_element.take() {
                let detail = st.pending_event_def.take();
                finish_start_event(st, id, name, detail);
            }
        }
        "endEvent" => {
            if let Some(ElementCtx::CatchOrThrow { id, name }) = st.current_element.take() {
                let detail = st.pending_event_def.take();
                finish_end_event(st, id, name, detail);
            }
        }
        "intermediateThrowEvent" => {
            if let Some(ElementCtx::CatchOrThrow { id, name }) = st.current_element.take() {
                let message_name = match st.pending_event_def.take() {
                    Some(EventDefKind::Message { message_name }) => Some(message_name),
                    _ => None,
                };
                add_node(
                    st,
                    FlowNode {
                        id,
                        name,
                        kind: NodeKind::IntermediateThrowEvent { message_name },
                        multi_instance: None,
                        listeners: Vec::new(),
                        in_variables: None,
                        out_variables: None,
                        container: st.container_stack.last().cloned(),
                    },
                );
            }
        }
        "intermediateCatchEvent" => {
            if let Some(ElementCtx::CatchOrThrow { id, name }) = st.current_element.take() {
                let (trigger, detail) = catch_trigger_detail(st)?;
                add_node(
                    st,
                    FlowNode {
                        id,
                        name,
                        kind: NodeKind::IntermediateCatchEvent { trigger, detail },
                        multi_instance: None,
                        listeners: Vec::new(),
                        in_variables: None,
                        out_variables: None,
                        container: st.container_stack.last().cloned(),
                    },
                );
            }
        }
        "boundaryEvent" => {
            if let Some(ElementCtx::Boundary {
                id,
                attached_to,
                cancel_activity,
            }) = st.current_element.take()
            {
                let (trigger, detail) = catch_trigger_detail(st)?;
                add_node(
                    st,
                    FlowNode {
                        id,
                        name: None,
                        kind: NodeKind::BoundaryEvent {
                            attached_to,
                            trigger,
                            detail,
                            cancel_activity,
                        },
                        multi_instance: None,
                        listeners: Vec::new(),
                        in_variables: None,
                        out_variables: None,
                        container: st.container_stack.last().cloned(),
                    },
                );
            }
        }
        "serviceTask" | "sendTask" | "userTask" | "receiveTask" | "scriptTask" | "manualTask" => {
            if let Some(ElementCtx::Task { id, name, kind }) = st.current_element.take() {
                finish_task(st, id, name, kind);
            }
        }
        "callActivity" => {
            if let Some(ElementCtx::Subprocess { id, name }) = st.current_element.take() {
                let called_element = st.pending_topic.take().unwrap_or_default();
                add_node(
                    st,
                    FlowNode {
                        id,
                        name,
                        kind: NodeKind::CallActivity {
                            called_element,
                            in_variables: st.pending_in_vars.take(),
                            out_variables: st.pending_out_vars.take(),
                        },
                        multi_instance: None,
                        listeners: Vec::new(),
                        in_variables: None,
                        out_variables: None,
                        container: st.container_stack.last().cloned(),
                    },
                );
            }
        }
        "sequenceFlow" => {
            if let Some(ElementCtx::Flow { id, source, target }) = st.current_element.take() {
                let condition = st.pending_condition_text.take();
                st.flows.push(SequenceFlow {
                    id,
                    source,
                    target,
                    condition,
                    is_default: false,
                });
            }
        }
        "subProcess" | "transaction" => {
            st.container_stack.pop();
        }
        _ => {}
    }
    Ok(())
}

fn catch_trigger_detail(st: &mut ParseState) -> Result<(CatchEventTrigger, CatchDetail)> {
    match st.pending_event_def.take() {
        Some(EventDefKind::Message { message_name }) => Ok((
            CatchEventTrigger::Message,
            CatchDetail::Message {
                message_name,
                corr_key_source: st.pending_corr_key.take().unwrap_or_default(),
            },
        )),
        Some(EventDefKind::Timer) => {
            let detail = match st.pending_timer_kind.take() {
                Some(TimerKind::Duration) => CatchDetail::TimerDuration {
                    iso8601_duration: st.pending_timer_text.take().unwrap_or_default(),
                },
                Some(TimerKind::Date) => CatchDetail::TimerDate {
                    iso8601_date: st.pending_timer_text.take().unwrap_or_default(),
                },
                Some(TimerKind::Cycle) => CatchDetail::TimerCycle {
                    iso8601_cycle: st.pending_timer_text.take().unwrap_or_default(),
                },
                None => return Err(anyhow!("timerEventDefinition missing duration/date/cycle")),
            };
            Ok((CatchEventTrigger::Timer, detail))
        }
        Some(EventDefKind::Signal { signal_name }) => {
            Ok((CatchEventTrigger::Signal, CatchDetail::Signal { signal_name }))
        }
        Some(EventDefKind::Error { error_code }) => {
            Ok((CatchEventTrigger::Error, CatchDetail::Error { error_code }))
        }
        Some(EventDefKind::Escalation) => Ok((CatchEventTrigger::Escalation, CatchDetail::None)),
        Some(EventDefKind::Conditional) => Ok((CatchEventTrigger::Conditional, CatchDetail::None)),
        None => Err(anyhow!("catch event has no supported event definition")),
        Some(_) => Err(anyhow!(
            "catch event has an event definition not valid on a catching element"
        )),
    }
}

fn finish_start_event(
    st: &mut ParseState,
    id: String,
    name: Option<String>,
    detail: Option<EventDefKind>,
) {
    let container = st.container_stack.last().cloned();
    let in_event_subprocess = container
        .as_ref()
        .and_then(|c| st.node_index.get(c))
        .map(|&i| matches!(st.nodes[i].kind, NodeKind::EventSubprocess { .. }))
        .unwrap_or(false);

    let kind = if in_event_subprocess {
        let trigger = match detail {
            Some(EventDefKind::Message { .. }) => CatchEventTrigger::Message,
            Some(EventDefKind::Timer) => CatchEventTrigger::Timer,
            Some(EventDefKind::Signal { .. }) => CatchEventTrigger::Signal,
            Some(EventDefKind::Error { .. }) => CatchEventTrigger::Error,
            Some(EventDefKind::Escalation) => CatchEventTrigger::Escalation,
            Some(EventDefKind::Conditional) => CatchEventTrigger::Conditional,
            _ => CatchEventTrigger::Message,
        };
        NodeKind::EventSubprocessStart { trigger }
    } else {
        let message_name = match detail {
            Some(EventDefKind::Message { message_name }) => Some(message_name),
            _ => None,
        };
        NodeKind::StartEvent { message_name }
    };

    if let Some(container_id) = &container {
        st.subprocess_start
            .entry(container_id.clone())
            .or_insert_with(|| id.clone());
    }

    add_node(
        st,
        FlowNode {
            id,
            name,
            kind,
            multi_instance: None,
            listeners: Vec::new(),
            in_variables: None,
            out_variables: None,
            container,
        },
    );
}

fn finish_end_event(st: &mut ParseState, id: String, name: Option<String>, detail: Option<EventDefKind>) {
    let kind = match detail {
        Some(EventDefKind::Message { .. }) => EndEventKind::Message,
        Some(EventDefKind::Error { .. }) => EndEventKind::Error,
        Some(EventDefKind::Terminate) => EndEventKind::Terminate,
        Some(EventDefKind::Cancel) => EndEventKind::Cancel,
        Some(EventDefKind::Compensation) => EndEventKind::Compensation,
        _ => EndEventKind::None,
    };
    add_node(
        st,
        FlowNode {
            id,
            name,
            kind: NodeKind::EndEvent { kind },
            multi_instance: None,
            listeners: Vec::new(),
            in_variables: None,
            out_variables: None,
            container: st.container_stack.last().cloned(),
        },
    );
}

fn finish_task(st: &mut ParseState, id: String, name: Option<String>, kind: TaskKind) {
    let node_kind = match kind {
        TaskKind::Service => NodeKind::ServiceTask {
            topic: st.pending_topic.take(),
        },
        TaskKind::Send => NodeKind::SendTask {
            topic: st.pending_topic.take(),
        },
        TaskKind::User => NodeKind::UserTask,
        TaskKind::Receive => NodeKind::ReceiveTask {
            message_name: st.pending_topic.take().unwrap_or_default(),
            corr_key_source: st.pending_corr_key.take().unwrap_or_default(),
        },
        TaskKind::Script => NodeKind::ScriptTask {
            script: st.pending_condition_text.take().unwrap_or_default(),
        },
        TaskKind::Manual => NodeKind::ManualTask,
    };
    let multi_instance = if st.pending_mi_cardinality.is_some() || st.pending_mi_completion.is_some() {
        Some(MultiInstanceSpec {
            mode: if st.pending_mi_sequential {
                MultiInstanceMode::Sequential
            } else {
                MultiInstanceMode::Parallel
            },
            cardinality_expr: st.pending_mi_cardinality.take().unwrap_or_default(),
            completion_condition: st.pending_mi_completion.take(),
        })
    } else {
        None
    };
    add_node(
        st,
        FlowNode {
            id,
            name,
            kind: node_kind,
            multi_instance,
            listeners: std::mem::take(&mut st.pending_listeners),
            in_variables: st.pending_in_vars.take(),
            out_variables: st.pending_out_vars.take(),
            container: st.container_stack.last().cloned(),
        },
    );
}

fn add_simple(st: &mut ParseState, e: &BytesStart, kind: NodeKind) -> Result<()> {
    let id = get_attr(e, "id")?;
    let name = get_attr_opt(e, "name");
    if let Some(default_flow) = get_attr_opt(e, "default") {
        st.default_flow_ids.insert(id.clone(), default_flow);
    }
    add_node(
        st,
        FlowNode {
            id,
            name,
            kind,
            multi_instance: None,
            listeners: Vec::new(),
            in_variables: None,
            out_variables: None,
            container: st.container_stack.last().cloned(),
        },
    );
    Ok(())
}

fn add_node(st: &mut ParseState, node: FlowNode) {
    st.node_index.insert(node.id.clone(), st.nodes.len());
    st.nodes.push(node);
}

// ─── XML helpers (grounded on bpmn-lite-core/src/compiler/parser.rs's local_name/get_attr) ────

fn local_name(name: &[u8]) -> String {
    let s = std::str::from_utf8(name).unwrap_or("");
    match s.rfind(':') {
        Some(pos) => s[pos + 1..].to_string(),
        None => s.to_string(),
    }
}

fn get_attr(e: &BytesStart, name: &str) -> Result<String> {
    for attr in e.attributes().flatten() {
        if local_name(attr.key.as_ref()) == name {
            return Ok(attr.unescape_value()?.to_string());
        }
    }
    Err(anyhow!("missing required attribute '{name}'"))
}

fn get_attr_opt(e: &BytesStart, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        if local_name(attr.key.as_ref()) == name {
            return attr.unescape_value().ok().map(|v| v.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_process_parses() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <bpmn:process id="proc1">
            <bpmn:startEvent id="start1" />
            <bpmn:serviceTask id="task1" name="Do thing">
              <bpmn:extensionElements>
                <taskDefinition type="double" />
              </bpmn:extensionElements>
            </bpmn:serviceTask>
            <bpmn:endEvent id="end1" />
            <bpmn:sequenceFlow id="f1" sourceRef="start1" targetRef="task1" />
            <bpmn:sequenceFlow id="f2" sourceRef="task1" targetRef="end1" />
          </bpmn:process>
        </bpmn:definitions>"#;

        let defn = parse_bpmn(xml, "proc1", 1).unwrap();
        assert_eq!(defn.nodes.len(), 3);
        assert_eq!(defn.flows.len(), 2);
        let task = defn.node("task1").unwrap();
        assert!(matches!(&task.kind, NodeKind::ServiceTask { topic: Some(t) } if t == "double"));
    }

    #[test]
    fn exclusive_gateway_condition_parses() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <bpmn:process id="proc1">
            <bpmn:startEvent id="start1" />
            <bpmn:exclusiveGateway id="gw1" />
            <bpmn:endEvent id="big" />
            <bpmn:endEvent id="small" />
            <bpmn:sequenceFlow id="f1" sourceRef="start1" targetRef="gw1" />
            <bpmn:sequenceFlow id="f2" sourceRef="gw1" targetRef="big">
              <bpmn:conditionExpression>${amount &gt;= 100}</bpmn:conditionExpression>
            </bpmn:sequenceFlow>
            <bpmn:sequenceFlow id="f3" sourceRef="gw1" targetRef="small" />
          </bpmn:process>
        </bpmn:definitions>"#;

        let defn = parse_bpmn(xml, "proc1", 1).unwrap();
        let conditioned = defn.flows.iter().filter(|f| f.condition.is_some()).count();
        assert_eq!(conditioned, 1);
    }

    #[test]
    fn embedded_subprocess_start_node_patched() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <bpmn:process id="proc1">
            <bpmn:startEvent id="start1" />
            <bpmn:subProcess id="sub1">
              <bpmn:startEvent id="subStart" />
              <bpmn:endEvent id="subEnd" />
              <bpmn:sequenceFlow id="fi" sourceRef="subStart" targetRef="subEnd" />
            </bpmn:subProcess>
            <bpmn:endEvent id="end1" />
            <bpmn:sequenceFlow id="f1" sourceRef="start1" targetRef="sub1" />
            <bpmn:sequenceFlow id="f2" sourceRef="sub1" targetRef="end1" />
          </bpmn:process>
        </bpmn:definitions>"#;

        let defn = parse_bpmn(xml, "proc1", 1).unwrap();
        let sub = defn.node("sub1").unwrap();
        match &sub.kind {
            NodeKind::EmbeddedSubprocess { start_node, .. } => assert_eq!(start_node, "subStart"),
            other => panic!("expected EmbeddedSubprocess, got {other:?}"),
        }
        let inner_start = defn.node("subStart").unwrap();
        assert_eq!(inner_start.container.as_deref(), Some("sub1"));
    }

    #[test]
    fn multi_instance_loop_characteristics_parsed() {
        let xml = r#"<?xml version="1.0"?>
        <bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <bpmn:process id="proc1">
            <bpmn:startEvent id="start1" />
            <bpmn:serviceTask id="task1">
              <bpmn:extensionElements>
                <taskDefinition type="notify" />
              </bpmn:extensionElements>
              <bpmn:multiInstanceLoopCharacteristics isSequential="false">
                <bpmn:loopCardinality>${nrOfItems}</bpmn:loopCardinality>
                <bpmn:completionCondition>${nrOfCompletedInstances &gt;= 1}</bpmn:completionCondition>
              </bpmn:multiInstanceLoopCharacteristics>
            </bpmn:serviceTask>
            <bpmn:endEvent id="end1" />
            <bpmn:sequenceFlow id="f1" sourceRef="start1" targetRef="task1" />
            <bpmn:sequenceFlow id="f2" sourceRef="task1" targetRef="end1" />
          </bpmn:process>
        </bpmn:definitions>"#;

        let defn = parse_bpmn(xml, "proc1", 1).unwrap();
        let task = defn.node("task1").unwrap();
        let mi = task.multi_instance.as_ref().expect("expected multi-instance spec");
        assert_eq!(mi.cardinality_expr, "${nrOfItems}");
        assert!(mi.completion_condition.is_some());
    }
}
