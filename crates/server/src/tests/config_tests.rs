use super::{
    apply_env_overrides, apply_file_overrides, normalize_database_url, prepare_database_url,
    Settings, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_OUTBOUND_QUEUE,
};

use std::collections::HashMap;

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn normalizes_windows_plain_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn converts_sqlite_double_slash_windows_path() {
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn keeps_in_memory_url() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn creates_parent_dir_for_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}

#[test]
fn defaults_match_documented_limits() {
    let settings = Settings::default();
    assert_eq!(settings.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    assert_eq!(settings.outbound_queue, DEFAULT_OUTBOUND_QUEUE);
}

#[test]
fn env_overrides_file_values() {
    let mut settings = Settings::default();
    apply_file_overrides(
        &mut settings,
        "bind_addr = \"0.0.0.0:9000\"\njwt_secret = \"from-file\"\nmax_upload_bytes = 1024\n",
    );
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.jwt_secret, "from-file");
    assert_eq!(settings.max_upload_bytes, 1024);

    let env: HashMap<&str, &str> = HashMap::from([
        ("SERVER_BIND", "127.0.0.1:1"),
        ("APP__BIND_ADDR", "127.0.0.1:2"),
        ("APP__JWT_SECRET", "from-env"),
        ("APP__OUTBOUND_QUEUE", "0"),
    ]);
    apply_env_overrides(&mut settings, |key| env.get(key).map(|v| v.to_string()));
    assert_eq!(settings.server_bind, "127.0.0.1:2");
    assert_eq!(settings.jwt_secret, "from-env");
    assert_eq!(settings.outbound_queue, 1);
    assert_eq!(settings.max_upload_bytes, 1024);
}
