// Policy file loading and validation.

use binward::config::FailureLevel;
use binward::Policy;
use tempfile::TempDir;

fn write_policy(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("policy.json");
    std::fs::write(&path, contents).expect("write policy file");
    path
}

#[test]
fn exported_policy_loads_back_unchanged() {
    let dir = TempDir::new().unwrap();
    let exported = Policy::default().to_pretty_json().unwrap();
    let path = write_policy(&dir, &exported);

    let policy = Policy::load(&path).expect("default export is a valid policy");
    assert_eq!(
        policy.engine.max_evidence_records,
        Policy::default().engine.max_evidence_records
    );
    assert_eq!(
        policy.rules.secure_tools.minimum_cxx_version,
        Policy::default().rules.secure_tools.minimum_cxx_version
    );
}

#[test]
fn partial_documents_inherit_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_policy(
        &dir,
        r#"{ "engine": { "max_evidence_records": 25 } }"#,
    );

    let policy = Policy::load(&path).unwrap();
    assert_eq!(policy.engine.max_evidence_records, 25);
    // Untouched rule options keep their defaults.
    assert!(policy.rules.compiler_warnings.required_warnings.contains(&4146));
}

#[test]
fn rule_options_are_keyed_by_rule_id() {
    let dir = TempDir::new().unwrap();
    let path = write_policy(
        &dir,
        r#"{
            "rules": {
                "BA2007": { "required_warnings": [4996] },
                "BA2014": { "approved_functions": ["LegacyHelper"] }
            }
        }"#,
    );

    let policy = Policy::load(&path).unwrap();
    assert_eq!(
        policy.rules.compiler_warnings.required_warnings,
        [4996].into_iter().collect()
    );
    assert!(policy
        .rules
        .stack_protection
        .approved_functions
        .contains("LegacyHelper"));
}

#[test]
fn severity_overrides_are_keyed_by_rule_id() {
    let dir = TempDir::new().unwrap();
    let path = write_policy(
        &dir,
        r#"{ "rule_levels": { "BA2006": "error", "BA3011": "note" } }"#,
    );

    let policy = Policy::load(&path).unwrap();
    assert_eq!(policy.rule_levels.get("BA2006"), Some(&FailureLevel::Error));
    assert_eq!(policy.rule_levels.get("BA3011"), Some(&FailureLevel::Note));
}

#[test]
fn severity_override_keys_must_be_rule_ids() {
    let dir = TempDir::new().unwrap();
    let path = write_policy(&dir, r#"{ "rule_levels": { "stack": "note" } }"#);

    let err = Policy::load(&path).unwrap_err();
    assert!(err.to_string().contains("not a rule id"));
}

#[test]
fn unknown_rule_ids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_policy(&dir, r#"{ "rules": { "BA9999": {} } }"#);

    let err = Policy::load(&path).unwrap_err();
    assert!(err.to_string().contains("invalid policy document"));
}

#[test]
fn malformed_json_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_policy(&dir, "{ not json");

    let err = Policy::load(&path).unwrap_err();
    assert!(err.to_string().contains("invalid policy document"));
}

#[test]
fn overlapping_mitigation_ranges_fail_validation() {
    let dir = TempDir::new().unwrap();
    let path = write_policy(
        &dir,
        r#"{
            "rules": {
                "BA2024": {
                    "mitigated_compilers": {
                        "x86": [
                            {
                                "range": { "min": "19.0.0.0", "max": "19.20.0.0" },
                                "mitigations": ["qspectre"]
                            },
                            {
                                "range": { "min": "19.10.0.0", "max": "*" },
                                "mitigations": ["qspectre"]
                            }
                        ]
                    }
                }
            }
        }"#,
    );

    let err = Policy::load(&path).unwrap_err();
    assert!(err.to_string().contains("overlap"));
}
