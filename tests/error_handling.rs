// tests/error_handling.rs

use std::io::Write;
use std::time::Duration;

use batchdag::config::{load_and_validate, parse_batch_file, parse_duration, validate_descriptors};
use batchdag::errors::BatchdagError;
use batchdag::types::TaskDescriptor;
use batchdag_test_utils::{BatchBuilder, DescriptorBuilder};
use tempfile::NamedTempFile;

fn write_tasks(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn test_valid_file_loads_in_declaration_order() {
    let file = write_tasks(
        r#"
[batch]
name = "nightly"
concurrency = 3
autosave_interval = "250ms"
escalation_timeout = "2m"

[[task]]
id = "build"
budget = 2.5
[task.payload]
cmd = "make"

[[task]]
id = "test"
depends_on = ["build", "build"]
[task.payload]
cmd = "make test"
"#,
    );

    let loaded = load_and_validate(file.path()).unwrap();
    assert_eq!(loaded.name, "nightly");
    assert!(loaded.source.matches(&std::fs::read(file.path()).unwrap()));

    let settings = &loaded.file.settings;
    assert_eq!(settings.concurrency, 3);
    assert_eq!(settings.autosave_interval, Duration::from_millis(250));
    assert_eq!(settings.escalation_timeout, Some(Duration::from_secs(120)));

    let options = settings.scheduler_options();
    assert_eq!(options.concurrency, 3);

    let tasks = &loaded.file.tasks;
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, "build");
    assert_eq!(tasks[0].budget, Some(2.5));
    assert_eq!(tasks[0].payload["cmd"], "make");
    assert_eq!(tasks[1].depends_on, vec!["build"]);
}

#[test]
fn test_batch_name_defaults_to_file_stem() {
    let mut file = tempfile::Builder::new()
        .prefix("release-")
        .suffix(".toml")
        .tempfile()
        .unwrap();
    write!(file, "[[task]]\nid = \"only\"\n").unwrap();

    let loaded = load_and_validate(file.path()).unwrap();
    let stem = file.path().file_stem().unwrap().to_str().unwrap();
    assert_eq!(loaded.name, stem);
    assert_eq!(loaded.file.settings.concurrency, 1);
    assert_eq!(loaded.file.settings.escalation_timeout, None);
}

#[test]
fn test_cycle_returns_structured_error() {
    let file = write_tasks(
        r#"
[[task]]
id = "A"
depends_on = ["B"]

[[task]]
id = "B"
depends_on = ["A"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(BatchdagError::CyclicDependency(msg)) => {
            assert!(msg.contains("cycle detected"));
            assert!(msg.contains("A") && msg.contains("B"));
        }
        Err(e) => panic!("Expected CyclicDependency error, got: {e:?}"),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_unknown_dependency_is_named() {
    let file = write_tasks(
        r#"
[[task]]
id = "A"
depends_on = ["missing"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(BatchdagError::UnknownDependency { task, dependency }) => {
            assert_eq!(task, "A");
            assert_eq!(dependency, "missing");
        }
        other => panic!("Expected UnknownDependency, got: {other:?}"),
    }
}

#[test]
fn test_self_dependency_is_a_config_error() {
    let err = parse_batch_file(
        r#"
[[task]]
id = "A"
depends_on = ["A"]
"#,
    )
    .unwrap_err();
    match err {
        BatchdagError::ConfigError(msg) => assert!(msg.contains("itself")),
        other => panic!("Expected ConfigError, got: {other:?}"),
    }
}

#[test]
fn test_duplicate_ids_are_rejected() {
    let err = parse_batch_file(
        r#"
[[task]]
id = "A"

[[task]]
id = "A"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, BatchdagError::DuplicateTask(id) if id == "A"));
}

#[test]
fn test_batch_section_is_validated() {
    let cases = [
        ("concurrency = 0", "concurrency"),
        ("autosave_interval = \"0s\"", "autosave_interval"),
        ("autosave_interval = \"5 parsecs\"", "autosave_interval"),
        ("escalation_timeout = \"soon\"", "escalation_timeout"),
    ];
    for (line, field) in cases {
        let contents = format!("[batch]\n{line}\n\n[[task]]\nid = \"A\"\n");
        match parse_batch_file(&contents) {
            Err(BatchdagError::ConfigError(msg)) => {
                assert!(msg.contains(field), "{msg} should mention {field}")
            }
            other => panic!("{line}: expected ConfigError, got {other:?}"),
        }
    }
}

#[test]
fn test_bad_budgets_and_empty_lists_are_rejected() {
    let negative = parse_batch_file("[[task]]\nid = \"A\"\nbudget = -1.0\n");
    assert!(matches!(negative, Err(BatchdagError::ConfigError(_))));

    let infinite = parse_batch_file("[[task]]\nid = \"A\"\nbudget = inf\n");
    assert!(matches!(infinite, Err(BatchdagError::ConfigError(_))));

    let empty = parse_batch_file("[batch]\nname = \"nothing\"\n");
    assert!(matches!(empty, Err(BatchdagError::ConfigError(_))));

    let blank_id = parse_batch_file("[[task]]\nid = \"  \"\n");
    assert!(matches!(blank_id, Err(BatchdagError::ConfigError(_))));
}

#[test]
fn test_malformed_toml_is_a_toml_error() {
    let err = parse_batch_file("[[task]\nid = ").unwrap_err();
    assert!(matches!(err, BatchdagError::TomlError(_)));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let err = load_and_validate("/definitely/not/here/Batchdag.toml").unwrap_err();
    assert!(matches!(err, BatchdagError::IoError(_)));
}

#[test]
fn test_builder_output_round_trips_through_the_loader() {
    let builder = BatchBuilder::new()
        .with(DescriptorBuilder::new("fetch").cmd("curl example.org").budget(1.5).build())
        .with(DescriptorBuilder::new("parse").after("fetch").cmd("jq .").build());
    let file = write_tasks(&builder.to_toml("name = \"pipeline\"\nconcurrency = 2"));

    let loaded = load_and_validate(file.path()).unwrap();
    let expected: Vec<TaskDescriptor> = builder.build();
    assert_eq!(loaded.file.tasks, expected);
    assert_eq!(loaded.file.settings.concurrency, 2);
}

#[test]
fn test_validate_descriptors_matches_file_validation() {
    let ok = BatchBuilder::new().task("A", &[]).task("B", &["A"]).build();
    assert!(validate_descriptors(&ok).is_ok());

    let self_dep = vec![TaskDescriptor::new("A").after("A")];
    assert!(matches!(
        validate_descriptors(&self_dep),
        Err(BatchdagError::ConfigError(_))
    ));
}

#[test]
fn test_parse_duration_units() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("3s"), Ok(Duration::from_secs(3)));
    assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
    assert_eq!(parse_duration(" 1h "), Ok(Duration::from_secs(3600)));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("5d").is_err());
}
