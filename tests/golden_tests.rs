//! Golden tests - fixture-based tests that lock expected behavior
//!
//! These tests use JSON fixtures to verify that on-disk names and formats
//! stay stable. Any change in behavior will cause these tests to fail,
//! signaling a change that breaks existing batches, snapshots or scopes.
//!
//! Run with: cargo test --test golden_tests

use serde::Deserialize;
use std::fs;

fn load_fixture<T: for<'de> Deserialize<'de>>(name: &str) -> T {
    let fixture_path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    let content = fs::read_to_string(&fixture_path)
        .unwrap_or_else(|e| panic!("Failed to read {} fixture: {}", name, e));
    serde_json::from_str(&content).expect("Failed to parse fixture JSON")
}

// ============================================================================
// SNAPSHOT DIRECTORY GOLDEN TESTS
// ============================================================================

mod snapshot_golden {
    use super::*;
    use std::path::{Path, PathBuf};
    use tracksync::batch::snapshot_directory;
    use tracksync::SyncParameters;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        scope: String,
        parameters: serde_json::Map<String, serde_json::Value>,
        expected: String,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_snapshot_directories_golden() {
        let fixture: Fixture = load_fixture("snapshot_directories.json");

        for case in fixture.test_cases {
            let mut parameters = SyncParameters::new();
            for (name, value) in case.parameters {
                parameters.insert(name, value);
            }
            let dir = snapshot_directory(Path::new("/snapshots"), &case.scope, &parameters);
            assert_eq!(
                dir,
                PathBuf::from("/snapshots").join(&case.expected),
                "Case '{}': directory mismatch",
                case.name
            );
        }
    }
}

// ============================================================================
// UPGRADE PATH GOLDEN TESTS
// ============================================================================

mod upgrade_golden {
    use super::*;
    use tracksync::upgrade::{parse_version, upgrade_path};
    use tracksync::SyncError;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        from: String,
        expected: Expected,
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Expected {
        Ok { ok: Vec<String> },
        Err { err: String },
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_upgrade_paths_golden() {
        let fixture: Fixture = load_fixture("upgrade_paths.json");

        for case in fixture.test_cases {
            let result = parse_version(&case.from).and_then(upgrade_path);

            match case.expected {
                Expected::Ok { ok } => {
                    let steps = result.unwrap_or_else(|e| {
                        panic!("Case '{}': expected Ok({:?}), got Err({})", case.name, ok, e)
                    });
                    let targets: Vec<String> = steps.iter().map(|s| s.to.to_string()).collect();
                    assert_eq!(targets, ok, "Case '{}': steps mismatch", case.name);
                }
                Expected::Err { err } => {
                    let actual = match result {
                        Ok(steps) => panic!(
                            "Case '{}': expected Err({}), got {} steps",
                            case.name,
                            err,
                            steps.len()
                        ),
                        Err(SyncError::InvalidVersion(_)) => "InvalidVersion",
                        Err(SyncError::Config(_)) => "Config",
                        Err(other) => panic!("Case '{}': unexpected error {}", case.name, other),
                    };
                    assert_eq!(actual, err, "Case '{}': error type mismatch", case.name);
                }
            }
        }
    }
}

// ============================================================================
// PART FORMAT GOLDEN TESTS
// ============================================================================

mod part_format_golden {
    use super::*;
    use tracksync::batch::{BatchPartWriter, JsonSerializerFactory, SerializerFactory};
    use tracksync::schema::TableRef;
    use tracksync::{RowState, SyncRow};

    #[derive(Debug, Deserialize)]
    struct Row {
        state: RowState,
        values: Vec<serde_json::Value>,
    }

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        table: String,
        schema: Option<String>,
        rows: Vec<Row>,
        expected: String,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[tokio::test]
    async fn test_part_format_golden() {
        let fixture: Fixture = load_fixture("part_format.json");
        let dir = tempfile::tempdir().unwrap();
        let factory = JsonSerializerFactory;

        for case in fixture.test_cases {
            let path = dir.path().join(format!("{}.json", case.name));
            let table = TableRef::new(case.table.clone(), case.schema.clone());
            let rows: Vec<SyncRow> = case
                .rows
                .into_iter()
                .map(|r| SyncRow::new(r.state, r.values))
                .collect();

            let mut writer = factory.create_writer(&path, &table).await.unwrap();
            for row in &rows {
                writer.write_row(row).await.unwrap();
            }
            let projected = writer.current_size();
            writer.close().await.unwrap();

            let text = fs::read_to_string(&path).unwrap();
            assert_eq!(text, case.expected, "Case '{}': encoding mismatch", case.name);
            assert_eq!(text.len(), projected, "Case '{}': size projection", case.name);

            let content = factory.read_part(&path).await.unwrap();
            assert_eq!(content.table, table, "Case '{}': table mismatch", case.name);
            assert_eq!(content.rows, rows, "Case '{}': rows mismatch", case.name);
        }
    }
}

// ============================================================================
// BATCH SUMMARY GOLDEN TESTS
// ============================================================================

mod summary_golden {
    use super::*;
    use tracksync::batch::{BatchInfo, BatchPartInfo};
    use tracksync::schema::TableRef;

    #[derive(Debug, Deserialize)]
    struct Part {
        file_name: String,
        table: String,
        schema: Option<String>,
        rows: u64,
    }

    #[derive(Debug, Deserialize)]
    struct Input {
        directory_root: String,
        directory_name: String,
        timestamp: i64,
        parts: Vec<Part>,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        input: Input,
        expected: serde_json::Value,
    }

    #[tokio::test]
    async fn test_batch_summary_golden() {
        let fixture: Fixture = load_fixture("batch_summary.json");
        let input = fixture.input;

        let mut batch = BatchInfo::at(&input.directory_root, &input.directory_name, "json");
        batch.timestamp = input.timestamp;
        for part in input.parts {
            let table = TableRef::new(part.table, part.schema);
            batch.parts.push(BatchPartInfo::new(part.file_name, &table, part.rows));
        }
        batch.renumber();

        assert_eq!(serde_json::to_value(&batch).unwrap(), fixture.expected);

        let parsed: BatchInfo = serde_json::from_value(fixture.expected).unwrap();
        assert_eq!(parsed, batch);

        // A summary written to disk loads back relative to where it lies
        let dir = tempfile::tempdir().unwrap();
        let mut moved = batch.clone();
        moved.directory_root = dir.path().to_path_buf();
        moved.save_summary().await.unwrap();
        let loaded = BatchInfo::load(moved.directory_path()).await.unwrap();
        assert_eq!(loaded, moved);
    }
}
