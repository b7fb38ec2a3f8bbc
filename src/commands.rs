//! CLI commands for droid-waiter
//!
//! Replays wait scenarios so timeouts and filters can be tuned without a
//! device attached.

use std::cell::Cell;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use droid_waiter_core::{
    BoundedEventWaiter, Callbacks, Event, ManualClock, Scenario, WaitConfig, WaitOutcome,
};

/// Result of replaying one scenario
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenario: String,
    pub event: String,
    pub matched: bool,
    pub elapsed_ms: u128,
    pub received: usize,
    pub waiting: usize,
    pub missed: usize,
    pub polls: usize,
    pub payload: Option<Value>,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.matched { "matched" } else { "gave up" };
        write!(
            f,
            "{}: {} {} after {:.3}s (received={}, waiting={}, missed={}, polls={})",
            self.scenario,
            self.event,
            verdict,
            self.elapsed_ms as f64 / 1000.0,
            self.received,
            self.waiting,
            self.missed,
            self.polls,
        )
    }
}

/// Simulate command options
pub struct SimulateCommand {
    pub scenario_path: PathBuf,
}

impl SimulateCommand {
    /// Load and replay the scenario file
    pub async fn execute(&self, config: &WaitConfig) -> Result<SimulationReport> {
        let scenario = Scenario::load(&self.scenario_path)
            .await
            .with_context(|| format!("loading scenario {:?}", self.scenario_path))?;
        run_scenario(scenario, config)
    }
}

/// Replay `scenario` on a manual clock
pub fn run_scenario(scenario: Scenario, config: &WaitConfig) -> Result<SimulationReport> {
    info!("Replaying scenario: {}", scenario.name);

    let name = scenario.name.clone();
    let event = scenario.event.clone();
    let timeout = scenario.timeout_or(config.default_timeout());
    let accept_after = scenario.accept_after;

    let clock = Arc::new(ManualClock::new());
    let source = scenario.into_source(Arc::clone(&clock));
    let waiter = BoundedEventWaiter::with_clock(Arc::clone(&clock))
        .with_progress_logging(config.log_progress);

    let received = Cell::new(0usize);
    let waiting = Cell::new(0usize);
    let missed = Cell::new(0usize);
    let mut callbacks = Callbacks::new()
        .on_received(|_: &Event<Value>, _| {
            received.set(received.get() + 1);
            received.get() > accept_after
        })
        .on_waiting(|_| waiting.set(waiting.get() + 1))
        .on_missed(|| missed.set(missed.get() + 1));

    let outcome = waiter
        .wait(&source, &event, timeout, &mut callbacks)
        .with_context(|| format!("scenario {} failed", name))?;
    drop(callbacks);

    let matched = outcome.is_matched();
    let elapsed_ms = outcome.elapsed().as_millis();
    let payload = match outcome {
        WaitOutcome::Matched { event, .. } => Some(event.into_payload()),
        WaitOutcome::GivenUp { .. } => None,
    };

    Ok(SimulationReport {
        scenario: name,
        event,
        matched,
        elapsed_ms,
        received: received.get(),
        waiting: waiting.get(),
        missed: missed.get(),
        polls: source.poll_count(),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(toml: &str) -> Scenario {
        Scenario::from_toml_str(toml).unwrap()
    }

    #[test]
    fn test_always_timing_out() {
        let report = run_scenario(
            scenario(
                r#"
                name = "silent"
                event = "onConnect"
                timeout_ms = 5000
                poll_quantum_ms = 2000
                "#,
            ),
            &WaitConfig::default(),
        )
        .unwrap();

        assert!(!report.matched);
        assert_eq!(report.elapsed_ms, 5000);
        assert_eq!(report.waiting, 3);
        assert_eq!(report.missed, 1);
        assert_eq!(report.received, 0);
        assert_eq!(
            report.to_string(),
            "silent: onConnect gave up after 5.000s (received=0, waiting=3, missed=1, polls=3)"
        );
    }

    #[test]
    fn test_reject_then_accept() {
        let report = run_scenario(
            scenario(
                r#"
                name = "bond"
                event = "onBond"
                timeout_ms = 10000
                poll_quantum_ms = 2000
                accept_after = 1

                [[events]]
                at_ms = 1000
                name = "onBond"
                payload = "bonding"

                [[events]]
                at_ms = 3000
                name = "onBond"
                payload = "bonded"
                "#,
            ),
            &WaitConfig::default(),
        )
        .unwrap();

        assert!(report.matched);
        assert_eq!(report.elapsed_ms, 3000);
        assert_eq!(report.received, 2);
        assert_eq!(report.missed, 0);
        assert_eq!(report.payload, Some(Value::String("bonded".into())));
    }

    #[test]
    fn test_transport_failure_is_an_error() {
        let err = run_scenario(
            scenario(
                r#"
                name = "reset"
                event = "onConnect"
                timeout_ms = 5000
                poll_quantum_ms = 1000

                [failure]
                at_ms = 1500
                message = "stream reset"
                "#,
            ),
            &WaitConfig::default(),
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("stream reset"));
    }

    #[tokio::test]
    async fn test_bundled_scenarios() {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios");
        let config = WaitConfig::default();

        let silent = SimulateCommand {
            scenario_path: dir.join("always_timing_out.toml"),
        };
        let report = silent.execute(&config).await.unwrap();
        assert!(!report.matched);
        assert_eq!(report.waiting, 3);

        let bond = SimulateCommand {
            scenario_path: dir.join("bond_after_retry.toml"),
        };
        let report = bond.execute(&config).await.unwrap();
        assert!(report.matched);
        assert_eq!(report.elapsed_ms, 3000);
        assert_eq!(report.payload.unwrap()["state"], "BOND_BONDED");

        let reset = SimulateCommand {
            scenario_path: dir.join("stream_reset.toml"),
        };
        assert!(reset.execute(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.toml");
        tokio::fs::write(
            &path,
            "name = \"scan\"\nevent = \"onScanResult\"\ntimeout_ms = 1000\npoll_quantum_ms = 500\n",
        )
        .await
        .unwrap();

        let command = SimulateCommand { scenario_path: path };
        let report = command.execute(&WaitConfig::default()).await.unwrap();
        assert_eq!(report.scenario, "scan");
        assert_eq!(report.polls, 2);
    }

    #[test]
    fn test_default_timeout_from_config() {
        let mut config = WaitConfig::default();
        config.default_timeout_ms = 3000;

        let report = run_scenario(
            scenario("name = \"n\"\nevent = \"onScan\"\npoll_quantum_ms = 1000\n"),
            &config,
        )
        .unwrap();
        assert_eq!(report.elapsed_ms, 3000);
        assert_eq!(report.waiting, 3);
    }
}
