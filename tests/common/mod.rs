#![allow(dead_code)]

pub use athome_test_utils::builders;
pub use athome_test_utils::recording;
pub use athome_test_utils::{init_tracing, with_timeout};

use std::time::Duration;

use athome::lifecycle::LifecycleState;
use athome::module::ModuleHandle;

/// Wait (bounded) until `handle` reports `state`.
pub async fn wait_state(handle: &ModuleHandle, state: LifecycleState) {
    let reached = handle
        .wait_for(Duration::from_secs(5), |s| s == state)
        .await
        .expect("state not reached in time");
    assert_eq!(reached, state, "module '{}' ended elsewhere", handle.name());
}
