//! RDF vocabulary for the engine's five named graphs.
//!
//! Every class and predicate used by the store lives under one namespace so
//! SPARQL patterns written anywhere in the engine agree on term shape.
//! IRIs are minted, never blank nodes, so a SPARQL pattern can reference an
//! instance, token, or task directly without a join through an anonymous node.

pub const NS: &str = "urn:bpmn-graph:";

/// Named graph IRIs, one per partition in §3 of the design.
pub mod graph {
    pub const DEFS: &str = "urn:bpmn-graph:graph:defs";
    pub const INST: &str = "urn:bpmn-graph:graph:inst";
    pub const TASKS: &str = "urn:bpmn-graph:graph:tasks";
    pub const LOG: &str = "urn:bpmn-graph:graph:log";
    pub const TIMERS: &str = "urn:bpmn-graph:graph:timers";

    pub const ALL: [&str; 5] = [DEFS, INST, TASKS, LOG, TIMERS];
}

/// Predicates, one per attribute named in the §3.1 entity table.
pub mod pred {
    macro_rules! p {
        ($name:ident, $suffix:literal) => {
            pub const $name: &str = concat!("urn:bpmn-graph:prop:", $suffix);
        };
    }

    p!(RDF_TYPE, "type");

    // ProcessDefinition
    p!(DEFINITION_ID, "definitionId");
    p!(VERSION, "version");
    p!(NAME, "name");
    p!(STATUS, "status");
    p!(SOURCE_XML, "sourceXml");

    // FlowNode
    p!(KIND, "kind");
    p!(TOPIC, "topic");
    p!(SCRIPT, "script");
    p!(LOOP_CHARACTERISTICS, "loopCharacteristics");
    p!(ATTACHED_TO, "attachedTo");
    p!(TRIGGERED_BY_EVENT, "triggeredByEvent");
    p!(CALLED_ELEMENT, "calledElement");
    p!(CANCEL_ACTIVITY, "cancelActivity");
    p!(DEFINITION_OF, "definitionOf");
    p!(ERROR_CODE, "errorCode");
    p!(MESSAGE_NAME, "messageName");
    p!(SIGNAL_NAME, "signalName");

    // SequenceFlow
    p!(SOURCE, "source");
    p!(TARGET, "target");
    p!(CONDITION, "condition");
    p!(IS_DEFAULT, "isDefault");

    // ProcessInstance
    p!(DEFINITION_REF, "definitionRef");
    p!(DEFINITION_VERSION, "definitionVersion");
    p!(CREATED_AT, "createdAt");
    p!(UPDATED_AT, "updatedAt");
    p!(COMPLETED_AT, "completedAt");
    p!(PARENT_INSTANCE, "parentInstance");
    p!(PARENT_CALL_NODE, "parentCallNode");

    // Token
    p!(OWNING_INSTANCE, "owningInstance");
    p!(CURRENT_NODE, "currentNode");
    p!(SCOPE_PATH, "scopePath");
    p!(TOKEN_STATE, "tokenState");
    p!(LOOP_INDEX, "loopIndex");

    // Variable
    p!(VAR_NAME, "varName");
    p!(VAR_VALUE, "varValue");
    p!(VAR_DATATYPE, "varDatatype");
    p!(VAR_SCOPE, "varScope");
    p!(VAR_INSTANCE, "varInstance");

    // UserTask
    p!(TASK_NODE, "taskNode");
    p!(TASK_INSTANCE, "taskInstance");
    p!(ASSIGNEE, "assignee");
    p!(CLAIMED_AT, "claimedAt");
    p!(TASK_COMPLETED_AT, "taskCompletedAt");
    p!(TASK_STATUS, "taskStatus");
    p!(TASK_TOKEN, "taskToken");

    // AuditEvent
    p!(EVENT_INSTANCE, "eventInstance");
    p!(EVENT_NODE, "eventNode");
    p!(EVENT_TYPE, "eventType");
    p!(EVENT_TIMESTAMP, "eventTimestamp");
    p!(EVENT_ACTOR, "eventActor");
    p!(EVENT_PAYLOAD, "eventPayload");
    p!(EVENT_SEQ, "eventSeq");

    // TimerJob
    p!(TIMER_INSTANCE, "timerInstance");
    p!(TIMER_TOKEN, "timerToken");
    p!(TIMER_TARGET_NODE, "timerTargetNode");
    p!(DUE_AT, "dueAt");
    p!(LEASE_HOLDER, "leaseHolder");
    p!(LEASE_EXPIRES_AT, "leaseExpiresAt");
    p!(ATTEMPTS, "attempts");
    p!(TIMER_STATUS, "timerStatus");

    // Message correlation
    p!(CORR_NAME, "corrName");
    p!(CORR_KEY, "corrKey");
    p!(CORR_INSTANCE, "corrInstance");
    p!(RACE_GROUP, "raceGroup");

    // AsyncHandlerJob
    p!(ASYNC_JOB_INSTANCE, "asyncJobInstance");
    p!(ASYNC_JOB_TOKEN, "asyncJobToken");
    p!(ASYNC_JOB_NODE, "asyncJobNode");
    p!(ASYNC_JOB_TOPIC, "asyncJobTopic");
    p!(ASYNC_JOB_STATUS, "asyncJobStatus");
}

/// Classes, one per entity in §3.1.
pub mod class {
    macro_rules! c {
        ($name:ident, $suffix:literal) => {
            pub const $name: &str = concat!("urn:bpmn-graph:class:", $suffix);
        };
    }

    c!(PROCESS_DEFINITION, "ProcessDefinition");
    c!(FLOW_NODE, "FlowNode");
    c!(SEQUENCE_FLOW, "SequenceFlow");
    c!(PROCESS_INSTANCE, "ProcessInstance");
    c!(TOKEN, "Token");
    c!(VARIABLE, "Variable");
    c!(USER_TASK, "UserTask");
    c!(AUDIT_EVENT, "AuditEvent");
    c!(TIMER_JOB, "TimerJob");
    c!(MESSAGE_SUBSCRIPTION, "MessageSubscription");
    c!(ASYNC_HANDLER_JOB, "AsyncHandlerJob");
}

/// Mint the canonical IRI for an entity: `urn:bpmn-graph:<kind>:<id>`.
pub fn iri(kind: &str, id: impl std::fmt::Display) -> String {
    format!("{NS}{kind}:{id}")
}
