//! Convergence polling against simulated controllers with real settle times.

use serde_json::json;
use stage_fleet::config::Settings;
use stage_fleet::convergence::{ConfigurationProbe, ConvergenceScheduler, MotionProbe};
use stage_fleet::events::{EventKind, FleetEvent};
use stage_fleet::families::{PiFamily, VirtualFamily};
use stage_fleet::model::{ActionRequest, Configuration};
use stage_fleet::settings::StageCatalog;
use stage_fleet::{Fleet, SessionInterface};
use std::sync::Arc;
use std::time::Duration;

const SN: i64 = 118_000_002;

fn fleet(settle: Duration) -> Arc<Fleet> {
    let mut settings = Settings::default();
    settings.simulation.settle_ms = u64::try_from(settle.as_millis()).unwrap();
    let fleet = Fleet::new();
    fleet
        .add_interface(Arc::new(SessionInterface::new(PiFamily::with_simulation(
            Arc::new(StageCatalog::default()),
            &settings,
        ))))
        .unwrap();
    fleet
        .add_interface(Arc::new(SessionInterface::new(VirtualFamily::new(settle))))
        .unwrap();
    Arc::new(fleet)
}

fn scheduler() -> ConvergenceScheduler {
    ConvergenceScheduler::new(Duration::from_millis(10), 100)
}

#[tokio::test]
async fn virtual_stages_converge_after_settle() {
    let fleet = fleet(Duration::from_millis(40));
    let responses = fleet
        .update_configurations(vec![
            json!({ "controller_type": "Virtual", "id": 1, "maximum": 10.0 }),
            json!({ "controller_type": "Virtual", "id": 2, "maximum": 20.0 }),
        ])
        .await
        .unwrap();
    assert!(responses.iter().all(|r| r.success));
    assert_eq!(fleet.is_configuration_configured(&[1, 2, 3]).await, vec![1, 2]);

    let report = scheduler()
        .arm(ConfigurationProbe(Arc::clone(&fleet)), vec![1, 2])
        .wait()
        .await
        .unwrap();
    assert!(report.converged());
    assert!(report.rounds >= 1);
    assert!(fleet.is_configuration_configured(&[1, 2]).await.is_empty());
}

#[tokio::test]
async fn pi_referencing_finishes_with_a_final_update() {
    let fleet = fleet(Duration::from_millis(30));
    let (_subscription, mut rx) = fleet
        .events()
        .channel(&[EventKind::ConfigurationUpdate])
        .unwrap();
    let responses = fleet
        .update_configurations(vec![json!({
            "controller_type": "PI",
            "id": SN,
            "model": "Simulated",
            "connection_type": "usb",
            "stages": [
                { "channel": 1, "device": "L-406.20DD10", "clo": true, "referenced": true },
                { "channel": 3, "device": "M-060.DG", "clo": true, "referenced": true },
            ],
        })])
        .await
        .unwrap();
    assert!(responses[0].success, "{responses:?}");

    let report = scheduler()
        .run(&ConfigurationProbe(Arc::clone(&fleet)), vec![SN])
        .await;
    assert!(report.converged());

    let mut last = None;
    while let Ok(FleetEvent::ConfigurationUpdate(update)) = rx.try_recv() {
        last = Some(update);
    }
    let last = last.unwrap();
    assert!(last.finished);
    assert!(!last.error);
    match last.configuration {
        Some(Configuration::Pi(config)) => {
            assert!(config.stages.values().all(|s| s.referenced));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn motion_converges_once_on_target() {
    let fleet = fleet(Duration::from_millis(30));
    fleet
        .update_configurations(vec![json!({
            "controller_type": "PI",
            "id": SN,
            "model": "Simulated",
            "connection_type": "usb",
            "stages": [{ "channel": 1, "device": "L-406.20DD10", "clo": true, "referenced": true }],
        })])
        .await
        .unwrap();
    scheduler()
        .run(&ConfigurationProbe(Arc::clone(&fleet)), vec![SN])
        .await;

    let stage = SN * 10 + 1;
    let results = fleet
        .execute_actions(vec![ActionRequest::move_to(stage, 25.0)])
        .await;
    assert_eq!(results, vec![Ok(())]);
    assert_eq!(fleet.on_target_pending(&[stage]).await, vec![stage]);

    let report = scheduler()
        .arm(MotionProbe(Arc::clone(&fleet)), vec![stage])
        .wait()
        .await
        .unwrap();
    assert!(report.converged());
    let status = fleet.stage_status(&[stage]).await.unwrap().remove(0).unwrap();
    assert_eq!(status.position, 25.0);
}
