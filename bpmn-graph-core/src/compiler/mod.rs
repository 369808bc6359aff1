//! BPMN 2.0 XML compiler front-end: parse → verify (design §4, C14).

pub mod defs_to_graph;
pub mod ir;
pub mod parser;
pub mod verifier;

pub use defs_to_graph::{
    list_definitions, load_definition, persist_definition, resolve_active_version, retire_definition,
};
pub use parser::parse_bpmn;
pub use verifier::{verify, verify_or_err, VerifyError};
