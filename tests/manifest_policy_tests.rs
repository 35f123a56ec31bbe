#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for the match session client.
//!
//! These tests verify that Cargo.toml keeps the panic-free lint policy and
//! the runtime feature set the session loop relies on. If any test fails,
//! the manifest has drifted from the agreed-upon standards.

use std::path::PathBuf;

/// Parses Cargo.toml from the project root.
fn manifest() -> toml::Table {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
    let contents = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read '{}': {}", path.display(), e));
    toml::from_str(&contents).expect("Cargo.toml must be valid TOML")
}

const REQUIRED_DENY_LINTS: &[&str] = &[
    "unwrap_used",
    "expect_used",
    "panic",
    "todo",
    "unimplemented",
    "indexing_slicing",
];

#[test]
fn clippy_panic_lints_are_denied() {
    let manifest = manifest();
    let clippy = manifest
        .get("lints")
        .and_then(|lints| lints.get("clippy"))
        .and_then(toml::Value::as_table)
        .expect("Cargo.toml is missing a [lints.clippy] section");

    for lint in REQUIRED_DENY_LINTS {
        assert_eq!(
            clippy.get(*lint).and_then(toml::Value::as_str),
            Some("deny"),
            "`{lint}` must be set to \"deny\" in [lints.clippy] to keep library code panic-free"
        );
    }
}

#[test]
fn rust_version_is_declared() {
    let manifest = manifest();
    let version = manifest
        .get("package")
        .and_then(|package| package.get("rust-version"))
        .and_then(toml::Value::as_str)
        .expect("Cargo.toml must declare a rust-version");
    assert!(
        version.split('.').count() == 3,
        "rust-version should be a full MAJOR.MINOR.PATCH version, got '{version}'"
    );
}

#[test]
fn tokio_features_cover_the_session_loop() {
    let manifest = manifest();
    let features: Vec<&str> = manifest
        .get("dependencies")
        .and_then(|deps| deps.get("tokio"))
        .and_then(|tokio| tokio.get("features"))
        .and_then(toml::Value::as_array)
        .expect("tokio must be declared with an explicit feature list")
        .iter()
        .filter_map(toml::Value::as_str)
        .collect();

    // select!, channels, the debounce timer and spawned room requests.
    for required in ["macros", "sync", "time", "rt"] {
        assert!(
            features.contains(&required),
            "tokio is missing the `{required}` feature"
        );
    }
}
