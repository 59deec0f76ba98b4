mod support;

use geolayer_sync::app::App;
use geolayer_sync::domain::Category;
use geolayer_sync::error::FailureKind;
use geolayer_sync::output::JsonOutput;
use geolayer_sync::reconcile::DEFAULT_MISSING_REASON;
use geolayer_sync::store::Placement;

use support::{Answer, BIOGAS, MockService, WKP, Workspace};

const BIOGAS_FILE: &str = "dbp_potensi_biogas_potensi_biogas_layer0.geojson";

#[test]
fn empty_data_root_reports_every_layer_missing() {
    let ws = Workspace::new(&format!("# Energi Terbarukan\n{BIOGAS}\n"));
    let service = MockService::default().with_layers(BIOGAS, &[(0, "Potensi Biogas")]);
    let app = App::new(ws.config(), service);

    let result = app.reconcile(None, &JsonOutput).unwrap();

    assert_eq!(result.expected_count, 1);
    assert_eq!(result.existing_count, 0);
    assert_eq!(result.missing_count, 1);
    let missing = &result.missing_details[0];
    assert_eq!(missing.filename, BIOGAS_FILE);
    assert_eq!(missing.reason, DEFAULT_MISSING_REASON);
    assert_eq!(missing.category, Category::EnergiTerbarukan);
    assert!(!ws.data("energi_terbarukan").as_std_path().exists());
    assert!(app.config().reconcile_report.as_std_path().is_file());
}

#[test]
fn after_run_everything_is_present() {
    let ws = Workspace::new(&format!("# Energi Terbarukan\n{BIOGAS}\n"));
    let service = MockService::default()
        .with_layers(BIOGAS, &[(0, "Potensi Biogas"), (1, "Sebaran")])
        .layer(BIOGAS, 0, vec![Answer::features(2)])
        .layer(BIOGAS, 1, vec![Answer::features(4)]);
    let app = App::new(ws.config(), service);

    app.run(&JsonOutput).unwrap();
    let result = app.reconcile(None, &JsonOutput).unwrap();

    assert_eq!(result.expected_count, 2);
    assert_eq!(result.existing_count, 2);
    assert_eq!(result.missing_count, 0);
    assert!(result.unexpected_artifacts.is_empty());
    assert!(result.recommendations.is_empty());
    assert_eq!(result.per_category[&Category::EnergiTerbarukan].existing, 2);
    assert!(result.total_bytes > 0);
}

#[test]
fn legacy_placement_counts_and_strays_are_listed() {
    let ws = Workspace::new(&format!("# Energi Terbarukan\n{BIOGAS}\n"));
    ws.write_data(&format!("Energi Terbarukan/{BIOGAS_FILE}"), "{}");
    ws.write_data("energi_terbarukan/old_service_layer9.geojson", "{}");
    let service = MockService::default().with_layers(BIOGAS, &[(0, "Potensi Biogas")]);
    let app = App::new(ws.config(), service);

    let result = app.reconcile(None, &JsonOutput).unwrap();

    assert_eq!(result.existing_count, 1);
    assert_eq!(result.present[0].placement, Placement::Legacy);
    assert_eq!(result.unexpected_artifacts.len(), 1);
    assert_eq!(
        result.unexpected_artifacts[0].filename,
        "old_service_layer9.geojson"
    );
}

#[test]
fn missing_reasons_come_from_the_last_run() {
    let ws = Workspace::new(&format!(
        "# Energi Terbarukan\n{BIOGAS}\n# Mineral & Batubara\n{WKP}\n"
    ));
    let service = MockService::default()
        .with_layers(BIOGAS, &[(0, "Potensi Biogas")])
        .layer(BIOGAS, 0, vec![Answer::Timeout])
        .metadata(WKP, vec![Answer::Status(503)]);
    let app = App::new(ws.config(), service);

    app.run(&JsonOutput).unwrap();
    let result = app.reconcile(None, &JsonOutput).unwrap();

    assert_eq!(result.expected_count, 1);
    assert_eq!(result.missing_count, 2);
    assert_eq!(result.missing_details[0].error_kind, Some(FailureKind::Timeout));
    assert_ne!(result.missing_details[0].reason, DEFAULT_MISSING_REASON);
    assert_eq!(result.endpoint_issues.len(), 1);
    assert_eq!(result.per_category[&Category::MineralBatubara].endpoint_errors, 1);
    assert_eq!(result.recommendations.len(), 2);
}

#[test]
fn reconcile_issues_no_downloads() {
    let ws = Workspace::new(&format!("# Energi Terbarukan\n{BIOGAS}\n"));
    let service = MockService::default()
        .with_layers(BIOGAS, &[(0, "Potensi Biogas")])
        .layer(BIOGAS, 0, vec![Answer::features(1)]);
    let app = App::new(ws.config(), service);

    app.reconcile(None, &JsonOutput).unwrap();

    assert_eq!(app.service().layer_calls(BIOGAS, 0), 0);
    assert!(ws.files_under("energi_terbarukan").is_empty());
}
