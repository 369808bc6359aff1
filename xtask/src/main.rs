//! Developer tooling, not part of the engine (design §1, "external collaborators").
//!
//! `cargo run -p xtask -- verify <file.bpmn>` parses a BPMN XML file through
//! the same compiler front-end the engine uses to deploy definitions and
//! prints the structural diagnostics, without touching any store.

use std::env;
use std::fs;
use std::process::ExitCode;

use bpmn_graph_core::compiler::{parse_bpmn, verify};

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("verify") => verify_cmd(args.next()),
        _ => {
            eprintln!("usage: xtask verify <file.bpmn>");
            ExitCode::FAILURE
        }
    }
}

fn verify_cmd(path: Option<String>) -> ExitCode {
    let Some(path) = path else {
        eprintln!("usage: xtask verify <file.bpmn>");
        return ExitCode::FAILURE;
    };

    let xml = match fs::read_to_string(&path) {
        Ok(xml) => xml,
        Err(e) => {
            eprintln!("reading {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let definition_id = std::path::Path::new(&path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("definition");

    let defn = match parse_bpmn(&xml, definition_id, 1) {
        Ok(defn) => defn,
        Err(e) => {
            eprintln!("parse failed: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let errors = verify(&defn);
    if errors.is_empty() {
        println!(
            "{path}: OK ({} nodes, {} flows)",
            defn.nodes.len(),
            defn.flows.len()
        );
        ExitCode::SUCCESS
    } else {
        for err in &errors {
            println!("{path}: {err}");
        }
        ExitCode::FAILURE
    }
}
