#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use quarry::storage::{IndexParams, StoreOptions};
use quarry::store::{Location, StoreConnection};
use quarry::Term;
use serde_json::Value;
use tempfile::TempDir;

fn setup_dataset(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(name);
    seed(&path).expect("seed dataset");
    (dir, path)
}

fn seed(path: &Path) -> quarry::types::Result<()> {
    let options = StoreOptions::default().params(IndexParams::default().block_size(2048));
    let conn = StoreConnection::open(Location::dir(path), &options)?;
    let name = Term::iri("http://xmlns.com/foaf/0.1/name");
    conn.coordinator().execute_write(|txn| {
        for (i, who) in ["Ada", "Grace", "Alan"].iter().enumerate() {
            let person = Term::iri(format!("http://example.org/people/{i}"));
            conn.storage()
                .triples()
                .add(txn, &[person.clone(), name.clone(), Term::literal(*who)])?;
            conn.storage().quads().add(
                txn,
                &[
                    Term::iri("http://example.org/graphs/demo"),
                    person,
                    name.clone(),
                    Term::lang(*who, "en"),
                ],
            )?;
        }
        Ok(())
    })?;
    conn.close()
}

#[test]
fn stats_emits_json() {
    let (_dir, path) = setup_dataset("stats");
    let output = cargo_bin_cmd!("quarry")
        .args(["--format", "json", "stats"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["params"]["block_size"].as_u64(), Some(2048));
    assert_eq!(json["dictionary"]["triples"].as_u64(), Some(3));
    assert_eq!(json["dictionary"]["quads"].as_u64(), Some(3));
    let indexes = json["indexes"].as_array().expect("index list");
    assert_eq!(indexes.len(), 11);
    assert!(indexes.iter().any(|index| index["name"] == "GSPO"));
}

#[test]
fn stats_text_lists_indexes() {
    let (_dir, path) = setup_dataset("stats_text");
    let output = cargo_bin_cmd!("quarry")
        .arg("stats")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Indexes:"));
    assert!(text.contains("OSP"));
    assert!(text.contains("Dictionary: terms="));
}

#[test]
fn verify_full_succeeds() {
    let (_dir, path) = setup_dataset("verify");
    let output = cargo_bin_cmd!("quarry")
        .args(["--format", "json", "verify", "--level", "full"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert!(json["success"].as_bool().unwrap_or(false));
    assert_eq!(json["counts"]["triples"].as_u64(), Some(3));
    assert_eq!(json["counts"]["quads"].as_u64(), Some(3));
}

#[test]
fn verify_in_mapped_mode_succeeds() {
    let (_dir, path) = setup_dataset("mapped");
    cargo_bin_cmd!("quarry")
        .args(["--mode", "mapped", "verify"])
        .arg(&path)
        .assert()
        .success();
}

fn dataset_files(path: &Path) -> BTreeMap<String, Vec<u8>> {
    fs::read_dir(path)
        .expect("dataset dir")
        .map(|entry| entry.expect("dir entry").path())
        .filter(|file| file.file_name().and_then(|name| name.to_str()) != Some("quarry.lock"))
        .map(|file| {
            let name = file.file_name().expect("file name").to_string_lossy().into_owned();
            (name, fs::read(&file).expect("read dataset file"))
        })
        .collect()
}

#[test]
fn mapped_verify_writes_nothing() {
    let (_dir, path) = setup_dataset("mapped_untouched");
    // uncommitted tail that writable recovery would cut off
    let objects = path.join("nodes.obj");
    let mut bytes = fs::read(&objects).expect("nodes.obj");
    bytes.extend_from_slice(&[0xEE; 16]);
    fs::write(&objects, bytes).expect("extend nodes.obj");
    let before = dataset_files(&path);

    cargo_bin_cmd!("quarry")
        .args(["--mode", "mapped", "verify"])
        .arg(&path)
        .assert()
        .success();
    assert_eq!(dataset_files(&path), before);
}

#[test]
fn verify_reports_damaged_index() {
    let (_dir, path) = setup_dataset("damaged");
    // every block of the SPO index zeroed
    let spo = path.join("SPO.dat");
    let len = fs::metadata(&spo).expect("SPO.dat").len();
    fs::write(&spo, vec![0u8; len as usize]).expect("zero SPO.dat");
    cargo_bin_cmd!("quarry")
        .args(["verify", "--level", "fast"])
        .arg(&path)
        .assert()
        .code(2);
}

#[test]
fn missing_dataset_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("quarry")
        .arg("stats")
        .arg(dir.path().join("nothing-here"))
        .assert()
        .failure()
        .code(1);
}
