//! Integration Test: Separation of Concerns
//!
//! **Policy**:
//! - Core is a library: it logs through `tracing` and never writes to stdout
//!   or stderr directly
//! - The show engine reads the component registry to pick recipients. Only
//!   the connection layer and the sync coordinator change registry entries.

use architectural_enforcement::{assert_clean, scan, source_dir};

/// Registry methods that change entries
const REGISTRY_MUTATORS: [&str; 7] = [
    ".register(",
    ".unregister(",
    ".mark_state(",
    ".transition(",
    ".release(",
    ".set_sync_status(",
    ".update_manifest(",
];

#[test]
fn test_core_has_no_print_statements() {
    let violations = scan(&source_dir("showrunner/core/src"), |code| {
        ["println!", "eprintln!", "print!(", "eprint!(", "dbg!("]
            .iter()
            .any(|m| code.contains(m))
    });

    assert_clean(
        "Core prints directly. Use tracing macros so the daemon controls output.",
        &violations,
    );
}

#[test]
fn test_engine_never_mutates_registry() {
    let violations = scan(&source_dir("showrunner/core/src/engine"), |code| {
        REGISTRY_MUTATORS.iter().any(|m| code.contains(m))
    });

    assert_clean(
        "The show engine mutates the component registry. Route the change through the connection layer.",
        &violations,
    );
}

#[test]
fn test_scanned_directories_exist() {
    // Guard against the checks above passing vacuously after a move
    for dir in ["showrunner/core/src", "showrunner/core/src/engine", "showrunner/daemon/src"] {
        assert!(source_dir(dir).is_dir(), "{dir} is missing");
    }
}
