use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn write_inputs(dir: &Path) {
    let mut features = String::from("bblid,scanid,ac_1,ac_2,ac_3\n");
    let mut phenotypes = String::from("bblid,scanid,Overall\n");
    for i in 0..30 {
        let t = i as f64;
        let (a, b, c) = ((t * 0.37).sin(), (t * 1.3).cos(), (t * 0.11).sin() * 2.0);
        writeln!(features, "{i},{},{a},{b},{c}", 100 + i).unwrap();
        writeln!(phenotypes, "{i},{},{}", 100 + i, 2.0 * a - b).unwrap();
    }
    fs::write(dir.join("x.csv"), features).expect("write features");
    fs::write(dir.join("y.csv"), phenotypes).expect("write phenotypes");
    fs::write(
        dir.join("settings.toml"),
        "n_splits = 3\nnested_grid_points = 3\nlesion_grid_points = 3\n",
    )
    .expect("write settings");
}

fn netpheno(dir: &Path, args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_netpheno");
    Command::new(exe)
        .current_dir(dir)
        .env_remove("SGE_TASK_ID")
        .args(args)
        .output()
        .expect("run netpheno cli")
}

#[test]
fn nested_cli_writes_results_for_task_seed() {
    let tmp = tempdir().expect("temporary directory");
    write_inputs(tmp.path());

    let exe = env!("CARGO_BIN_EXE_netpheno");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .env("SGE_TASK_ID", "3")
        .args([
            "nested", "-x", "x.csv", "-y", "y.csv", "--metric", "ac", "--pheno", "Overall",
            "--alg", "krr_rbf", "-o", "out", "--config", "settings.toml",
        ])
        .status()
        .expect("run netpheno cli");

    assert!(status.success(), "CLI exited with status {status:?}");
    let dir = tmp.path().join("out/split_2/krr_rbf_ac_Overall");
    for name in ["best_params.json", "best_scores.json", "nested_score.csv"] {
        assert!(dir.join(name).exists(), "{name} missing");
    }
}

#[test]
fn lesion_cli_writes_results_under_score_directory() {
    let tmp = tempdir().expect("temporary directory");
    write_inputs(tmp.path());

    let output = netpheno(
        tmp.path(),
        &[
            "lesion", "-x", "x.csv", "-y", "y.csv", "--metric", "ac", "--pheno", "Overall",
            "--alg", "rr", "--seed", "0", "--score", "corr", "-o", "out", "--config",
            "settings.toml",
        ],
    );
    assert!(output.status.success(), "CLI failed: {output:?}");
    let dir = tmp.path().join("out/corr/split_0/rr_ac_Overall");
    assert!(dir.join("shuf_lesioned_accuracy.txt").exists());
}

#[test]
fn missing_seed_is_reported_as_an_error() {
    let tmp = tempdir().expect("temporary directory");
    write_inputs(tmp.path());

    let output = netpheno(
        tmp.path(),
        &[
            "nested", "-x", "x.csv", "-y", "y.csv", "--metric", "ac", "--pheno", "Overall",
            "--alg", "rr", "-o", "out",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "unexpected stderr: {stderr}");
    assert!(!tmp.path().join("out").exists());
}

#[test]
fn unknown_phenotype_fails_before_fitting() {
    let tmp = tempdir().expect("temporary directory");
    write_inputs(tmp.path());

    let output = netpheno(
        tmp.path(),
        &[
            "nested", "-x", "x.csv", "-y", "y.csv", "--metric", "ac", "--pheno", "Mood",
            "--alg", "rr", "--seed", "1", "-o", "out",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Mood"));
}

#[test]
fn grids_lists_every_algorithm() {
    let tmp = tempdir().expect("temporary directory");
    let output = netpheno(tmp.path(), &["grids", "--points", "3"]);
    assert!(output.status.success(), "CLI failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    for id in ["rr", "lr", "krr_lin", "krr_rbf", "svr_lin", "svr_rbf"] {
        assert!(
            stdout.lines().any(|line| line.starts_with(&format!("{id} ("))),
            "{id} missing from: {stdout}"
        );
    }
    assert!(stdout.contains("svr_rbf (9 candidates)"));

    let output = netpheno(tmp.path(), &["grids", "--points", "1"]);
    assert_eq!(output.status.code(), Some(1));
}
