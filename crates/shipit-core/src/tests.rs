use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::*;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "shipit-core-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn write_bundle(root: &Path, metadata: &str, executable: Option<&str>) {
    fs::create_dir_all(executable_dir(root)).expect("must create executable dir");
    fs::write(metadata_path(root), metadata).expect("must write metadata");
    if let Some(name) = executable {
        let exe = executable_dir(root).join(name);
        fs::write(&exe, b"#!/bin/sh\nexit 0\n").expect("must write executable");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&exe, fs::Permissions::from_mode(0o755))
                .expect("must chmod executable");
        }
    }
}

const DEMO_METADATA: &str = r#"
identifier = "com.example.demo"
short_version = "1.0"
build_version = "100"
executable = "Demo"
"#;

#[test]
fn parse_bundle_info() {
    let info = BundleInfo::from_toml_str(DEMO_METADATA).expect("metadata should parse");
    assert_eq!(info.identifier, "com.example.demo");
    assert_eq!(info.short_version, "1.0");
    assert_eq!(info.build_version(), "100");
    assert_eq!(info.executable, "Demo");
}

#[test]
fn build_version_defaults_to_short_version() {
    let info = BundleInfo::from_toml_str(
        "identifier = \"com.example.demo\"\nshort_version = \"2.3\"\nexecutable = \"Demo\"\n",
    )
    .expect("metadata should parse");
    assert_eq!(info.build_version(), "2.3");
}

#[test]
fn reject_empty_identifier() {
    let err = BundleInfo::from_toml_str(
        "identifier = \" \"\nshort_version = \"1.0\"\nexecutable = \"Demo\"\n",
    )
    .expect_err("blank identifier must fail");
    assert!(err.to_string().contains("identifier must not be empty"));
}

#[test]
fn reject_nested_executable_name() {
    let err = BundleInfo::from_toml_str(
        "identifier = \"com.example.demo\"\nshort_version = \"1.0\"\nexecutable = \"../evil\"\n",
    )
    .expect_err("path traversal executable must fail");
    assert!(format!("{err:#}").contains("single file name"));
}

#[test]
fn bundle_info_round_trips_through_toml() {
    let info = BundleInfo::from_toml_str(DEMO_METADATA).expect("metadata should parse");
    let rendered = info.to_toml_string().expect("must render");
    assert_eq!(
        BundleInfo::from_toml_str(&rendered).expect("rendered metadata should parse"),
        info
    );
}

#[test]
fn resolve_reads_identity() {
    let root = test_dir();
    let bundle = root.join("Demo.app");
    write_bundle(&bundle, DEMO_METADATA, Some("Demo"));

    let identity = resolve(&bundle).expect("bundle should resolve");
    assert_eq!(identity.bundle_identifier, "com.example.demo");
    assert_eq!(identity.short_version, "1.0");
    assert_eq!(identity.build_version, "100");
    assert_eq!(
        identity.executable_path,
        bundle.join("Contents").join("MacOS").join("Demo")
    );
    assert_eq!(identity.version_label(), "1.0 (100)");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn resolve_rejects_plain_file() {
    let root = test_dir();
    let file = root.join("Demo.app");
    fs::write(&file, b"not a bundle").expect("must write file");

    let err = resolve(&file).expect_err("file must be rejected");
    assert!(matches!(err, BundleError::NotABundle { .. }));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn resolve_rejects_missing_contents() {
    let root = test_dir();
    let bundle = root.join("Demo.app");
    fs::create_dir_all(&bundle).expect("must create dir");

    let err = resolve(&bundle).expect_err("empty dir must be rejected");
    assert!(matches!(err, BundleError::NotABundle { .. }));
    assert!(err.to_string().contains("Contents/"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn resolve_reports_missing_metadata() {
    let root = test_dir();
    let bundle = root.join("Demo.app");
    fs::create_dir_all(contents_dir(&bundle)).expect("must create contents");

    let err = resolve(&bundle).expect_err("missing metadata must fail");
    assert!(matches!(err, BundleError::MissingMetadata { .. }));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn resolve_reports_unparseable_metadata() {
    let root = test_dir();
    let bundle = root.join("Demo.app");
    write_bundle(&bundle, "identifier = [", Some("Demo"));

    let err = resolve(&bundle).expect_err("malformed metadata must fail");
    assert!(matches!(err, BundleError::MissingMetadata { .. }));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn same_release_ignores_location() {
    let a = BundleIdentity {
        bundle_identifier: "com.example.demo".to_string(),
        short_version: "1.1".to_string(),
        build_version: "110".to_string(),
        executable_path: PathBuf::from("/a/Demo.app/Contents/MacOS/Demo"),
    };
    let mut b = a.clone();
    b.executable_path = PathBuf::from("/b/Demo.app/Contents/MacOS/Demo");
    assert!(a.same_release(&b));

    b.build_version = "111".to_string();
    assert!(!a.same_release(&b));
}

#[test]
fn digest_is_stable_and_content_sensitive() {
    let root = test_dir();
    let first = root.join("first.app");
    let second = root.join("second.app");
    write_bundle(&first, DEMO_METADATA, Some("Demo"));
    write_bundle(&second, DEMO_METADATA, Some("Demo"));

    let first_digest = bundle_digest(&first).expect("must digest");
    assert!(first_digest.starts_with("sha256:"));
    assert_eq!(first_digest, bundle_digest(&second).expect("must digest"));

    fs::write(executable_dir(&second).join("Demo"), b"#!/bin/sh\nexit 1\n")
        .expect("must rewrite executable");
    assert_ne!(first_digest, bundle_digest(&second).expect("must digest"));

    let _ = fs::remove_dir_all(root);
}

#[cfg(unix)]
#[test]
fn digest_tracks_executable_bit() {
    use std::os::unix::fs::PermissionsExt;

    let root = test_dir();
    let bundle = root.join("Demo.app");
    write_bundle(&bundle, DEMO_METADATA, Some("Demo"));
    let before = bundle_digest(&bundle).expect("must digest");

    let exe = executable_dir(&bundle).join("Demo");
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o644)).expect("must chmod");
    assert_ne!(before, bundle_digest(&bundle).expect("must digest"));
    assert!(!is_executable(&fs::metadata(&exe).expect("must stat")));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn sha256_hex_matches_known_vector() {
    assert_eq!(
        sha256_hex(b"abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}
