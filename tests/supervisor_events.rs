mod common;
use crate::common::builders::{ConfigFileBuilder, SubsystemConfigBuilder};
use crate::common::recording::recording_factories;
use crate::common::{init_tracing, wait_state, with_timeout};

use std::error::Error;
use std::time::Duration;

use athome::core::{ServeExit, Supervisor};
use athome::lifecycle::LifecycleState;
use athome::types::ShutdownPolicy;
use proptest::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn Error>>;

fn names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("sub_{i}")).collect()
}

/// Emit `events` through the core handle and return what each subsystem saw.
fn deliver(subsystems: usize, events: Vec<u32>) -> Vec<Vec<u32>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async move {
        let names = names(subsystems);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (factories, recorders) = recording_factories(&refs);

        let mut builder = ConfigFileBuilder::new();
        for name in &names {
            builder = builder.with_subsystem(name, SubsystemConfigBuilder::new("recording").build());
        }
        let mut supervisor = Supervisor::new(builder.build(), factories);
        supervisor.initialize().unwrap();
        supervisor.start().unwrap();

        let core = supervisor.handle();
        for value in &events {
            core.emit("ev_fifo", json!(value));
        }
        core.request_stop();

        let exit = supervisor.serve(CancellationToken::new()).await;
        assert_eq!(exit, ServeExit::StopRequested);
        supervisor.stop().await.unwrap();
        supervisor.shutdown().await.unwrap();

        recorders
            .values()
            .map(|recorder| {
                recorder
                    .events_with_prefix("ev_")
                    .into_iter()
                    .map(|(_, data)| data.as_u64().unwrap() as u32)
                    .collect()
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_subsystem_sees_emits_in_order(
        subsystems in 1usize..4,
        events in proptest::collection::vec(any::<u32>(), 0..32),
    ) {
        let seen = deliver(subsystems, events.clone());
        prop_assert_eq!(seen.len(), subsystems);
        for per_subsystem in seen {
            prop_assert_eq!(&per_subsystem, &events);
        }
    }
}

#[tokio::test]
async fn dependent_starts_only_after_its_dependency() -> TestResult {
    init_tracing();
    let (factories, recorders) = recording_factories(&["bridge", "broker"]);
    let config = ConfigFileBuilder::new()
        .with_subsystem("broker", SubsystemConfigBuilder::new("recording").build())
        .with_subsystem(
            "bridge",
            SubsystemConfigBuilder::new("recording").after("broker").build(),
        )
        .build();

    let mut supervisor = Supervisor::new(config, factories);
    supervisor.initialize()?;
    let broker = supervisor.subsystem("broker").unwrap().clone();
    let bridge = supervisor.subsystem("bridge").unwrap().clone();
    supervisor.start()?;

    let core = supervisor.handle();
    let observer = tokio::spawn(async move {
        wait_state(&broker, LifecycleState::Running).await;
        wait_state(&bridge, LifecycleState::Running).await;
        core.request_stop();
    });

    let exit = with_timeout(supervisor.serve(CancellationToken::new())).await;
    assert_eq!(exit, ServeExit::StopRequested);
    observer.await?;

    // The bridge saw the broker announce itself before it started.
    let bridge_events = recorders["bridge"].events_with_prefix("broker_");
    assert_eq!(bridge_events.first().map(|(e, _)| e.as_str()), Some("broker_started"));

    supervisor.stop().await?;
    assert_eq!(supervisor.subsystem_state("broker"), Some(LifecycleState::Ready));
    assert_eq!(supervisor.subsystem_state("bridge"), Some(LifecycleState::Ready));

    supervisor.shutdown().await?;
    assert_eq!(supervisor.state(), LifecycleState::Closed);
    for name in ["broker", "bridge"] {
        assert_eq!(supervisor.subsystem_state(name), Some(LifecycleState::Closed));
    }
    Ok(())
}

#[tokio::test]
async fn shutdown_policy_decides_whether_running_subsystems_stop_first() -> TestResult {
    init_tracing();
    for (policy, expect_stop) in [(ShutdownPolicy::ImplicitStop, true), (ShutdownPolicy::Direct, false)] {
        let (factories, recorders) = recording_factories(&["api"]);
        let config = ConfigFileBuilder::new()
            .with_subsystem("api", SubsystemConfigBuilder::new("recording").build())
            .shutdown_policy(policy)
            .shutdown_timeout(Duration::from_secs(2))
            .build();

        let mut supervisor = Supervisor::new(config, factories);
        supervisor.initialize()?;
        let api = supervisor.subsystem("api").unwrap().clone();
        supervisor.start()?;
        wait_state(&api, LifecycleState::Running).await;

        supervisor.shutdown().await?;
        assert_eq!(api.state(), LifecycleState::Closed);
        let hooks = recorders["api"].hooks();
        assert_eq!(hooks.contains(&"stop".to_string()), expect_stop, "{policy:?}: {hooks:?}");
        assert_eq!(hooks.last().map(String::as_str), Some("shutdown"));
    }
    Ok(())
}
