//! Saved configuration sets and stage catalogs on disk.

use serde_json::json;
use stage_fleet::families::VirtualFamily;
use stage_fleet::model::StageKind;
use stage_fleet::settings::{
    ConfigurationSets, JsonSettingsVault, SettingsStore, StageCatalog, PI_STAGES_STORE,
};
use stage_fleet::{Fleet, SessionInterface};
use std::sync::Arc;
use std::time::Duration;

fn fleet_on(vault: Arc<JsonSettingsVault>) -> Fleet {
    let store: Arc<dyn SettingsStore> = vault;
    let fleet = Fleet::with_sets(ConfigurationSets::new(store));
    fleet
        .add_interface(Arc::new(SessionInterface::new(VirtualFamily::new(
            Duration::ZERO,
        ))))
        .unwrap();
    fleet
}

#[tokio::test]
async fn saved_set_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let vault = Arc::new(JsonSettingsVault::new(dir.path()));

    {
        let fleet = fleet_on(Arc::clone(&vault));
        fleet
            .update_configurations(vec![
                json!({ "controller_type": "Virtual", "id": 1, "maximum": 10.0 }),
                json!({ "controller_type": "Virtual", "id": 2, "maximum": 25.0 }),
            ])
            .await
            .unwrap();
        assert_eq!(fleet.save_current_set("bench").await.unwrap(), 2);
        fleet.shutdown().await;
    }

    assert!(dir.path().join("configuration.json").exists());

    let fleet = fleet_on(vault);
    let responses = fleet.load_set("bench").await.unwrap().unwrap();
    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.success));
    let mut keys: Vec<i64> = fleet.current_configurations().iter().map(|c| c.id()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![1, 2]);

    assert!(fleet.remove_set("bench").await.unwrap());
    assert!(!fleet.remove_set("bench").await.unwrap());
    assert!(fleet.list_sets().await.unwrap().is_empty());
}

#[tokio::test]
async fn stage_catalog_loads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("PIStages.json"),
        r#"{ "M-060.DG": { "type": "rotational" }, "L-406.20DD10": { "type": "linear" } }"#,
    )
    .unwrap();
    let vault = JsonSettingsVault::new(dir.path());

    let catalog = StageCatalog::load(&vault, PI_STAGES_STORE).await.unwrap();
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog.classify("M-060.DG").kind, StageKind::Rotational);
    assert_eq!(catalog.classify("unheard-of").kind, StageKind::Linear);

    let empty = StageCatalog::load(&vault, "StandaStages").await.unwrap();
    assert!(empty.is_empty());
}
