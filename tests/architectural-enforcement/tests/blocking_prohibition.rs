//! Integration Test: No Blocking in Async Code
//!
//! **Policy**: Core and the daemon run on tokio. Production code must not
//! block a runtime thread.
//!
//! - No `std::thread::sleep` anywhere
//! - No `tokio::time::sleep` as a wait-for-event substitute (deadlines use
//!   `sleep_until` with a computed instant, timeouts use `timeout`)
//! - No `std::fs` inside `async fn`
//! - No blocking sockets (`std::net::TcpStream` / `TcpListener`)

use architectural_enforcement::{assert_clean, in_async_fn, scan, scan_with_context, source_dir};

const PRODUCTION_DIRS: [&str; 2] = ["showrunner/core/src", "showrunner/daemon/src"];

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<_> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| {
            scan(&source_dir(dir), |code| {
                code.contains("thread::sleep") || code.contains("time::sleep(")
            })
        })
        .collect();

    assert_clean(
        "Sleep calls found in production code. Wait on I/O, a channel or a deadline instead.",
        &violations,
    );
}

#[test]
fn test_no_blocking_io_in_async_functions() {
    let violations: Vec<_> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| {
            scan_with_context(&source_dir(dir), |lines, idx| {
                let code = &lines[idx].1;
                code.contains("std::fs::") && in_async_fn(lines, idx)
            })
        })
        .collect();

    assert_clean(
        "Blocking file I/O inside async functions. Load files before the runtime or use tokio::fs.",
        &violations,
    );
}

#[test]
fn test_no_blocking_sockets() {
    let violations: Vec<_> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| {
            scan(&source_dir(dir), |code| {
                code.contains("std::net::TcpStream") || code.contains("std::net::TcpListener")
            })
        })
        .collect();

    assert_clean(
        "Blocking sockets found. Use tokio::net.",
        &violations,
    );
}
