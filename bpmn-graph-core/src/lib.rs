//! BPMN 2.0 RDF/SPARQL orchestration engine core (design §2).
//!
//! A process definition is compiled from BPMN XML into a `ProcessDefinition`
//! (`compiler`), deployed into the `defs` named graph, and driven forward one
//! token at a time against the graph store's `inst`/`tasks`/`log`/`timers`
//! graphs. Every subsystem talks to the store through the `GraphStore` trait;
//! there is no other shared mutable state in the process.

pub mod async_jobs;
pub mod audit;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod control_api;
pub mod error;
pub mod event_router;
pub mod executor;
pub mod handlers;
pub mod scope;
pub mod store;
pub mod supervisor;
pub mod timer;
pub mod types;
pub mod variables;
pub mod vocab;

pub use config::EngineConfig;
pub use control_api::ControlApi;
pub use error::{EngineError, EngineResult};
pub use event_router::EventRouter;
pub use executor::{Executor, StepOutcome};
pub use handlers::HandlerRegistry;
pub use store::{GraphStore, OxigraphStore};
pub use supervisor::InstanceSupervisor;
pub use timer::TimerService;
pub use variables::VariableStore;
