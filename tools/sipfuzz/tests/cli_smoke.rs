use assert_cmd::cargo::cargo_bin_cmd;
use std::path::Path;

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let out = dir.join("out");
    let config = format!(
        "{body}\n\n[output]\nbase_dir = \"{out}\"\nscenarios_dir = \"{out}/scenarios\"\nlogs_dir = \"{out}/logs\"\nlogcat_dir = \"{out}/logcat\"\ncrashes_dir = \"{out}/crashes\"\n",
        out = out.display()
    );
    let path = dir.join("fuzzing_config.toml");
    std::fs::write(&path, config).expect("write config");
    path
}

fn report_in(dir: &Path, prefix: &str) -> serde_json::Value {
    let entry = std::fs::read_dir(dir)
        .expect("output dir")
        .filter_map(Result::ok)
        .find(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
        .unwrap_or_else(|| panic!("no {prefix} report in {}", dir.display()));
    let text = std::fs::read_to_string(entry.path()).expect("report");
    serde_json::from_str(&text).expect("json")
}

#[test]
fn help_lists_mode_flags() {
    let mut cmd = cargo_bin_cmd!("sipfuzz");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("--baseline"));
    assert!(stdout.contains("--fuzz"));
    assert!(stdout.contains("--iterations"));
}

#[test]
fn missing_mode_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("sipfuzz");
    cmd.current_dir(temp.path());
    cmd.assert().failure();
}

#[test]
fn invalid_config_path_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("sipfuzz");
    cmd.arg("--fuzz")
        .arg("--config")
        .arg(temp.path().join("missing.toml"));
    cmd.assert().failure();
}

#[test]
fn invalid_config_values_exit_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_config(temp.path(), "[target]\nip = \"not-an-ip\"");
    let mut cmd = cargo_bin_cmd!("sipfuzz");
    cmd.arg("--baseline").arg("--config").arg(config);
    cmd.assert().failure();
}

#[cfg(unix)]
#[test]
fn baseline_runs_the_template_and_writes_its_report() {
    let temp = tempfile::tempdir().expect("tempdir");
    let template = temp.path().join("register.xml");
    std::fs::write(&template, "<scenario/>").expect("template");
    let config = write_config(
        temp.path(),
        "[runner]\nprogram = \"sh\"\nargs = [\"-c\", \"echo sent {scenario}\"]",
    );

    let mut cmd = cargo_bin_cmd!("sipfuzz");
    cmd.arg("--baseline")
        .arg("--config")
        .arg(&config)
        .arg("--template")
        .arg(&template);
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("BASELINE TEST RESULT"));
    assert!(stdout.contains("Success: true"));

    let report = report_in(&temp.path().join("out"), "baseline_result_");
    assert_eq!(report["test_type"], "baseline");
    assert_eq!(report["result"]["exit_code"], 0);
    assert!(report["result"]["stdout"]
        .as_str()
        .unwrap_or_default()
        .contains("register.xml"));
}

#[cfg(unix)]
#[test]
fn fuzz_campaign_keeps_going_after_a_failing_case() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scenarios = temp.path().join("out/scenarios");
    std::fs::create_dir_all(&scenarios).expect("scenarios dir");
    for name in ["case_a.xml", "case_b.xml", "case_c.xml", "notes.txt"] {
        std::fs::write(scenarios.join(name), "<scenario/>").expect("scenario");
    }
    let template = temp.path().join("register.xml");
    std::fs::write(&template, "<scenario/>").expect("template");
    let config = write_config(
        temp.path(),
        &format!(
            "[runner]\nprogram = \"sh\"\nargs = [\"-c\", \"case {{scenario}} in *case_b.xml) exit 3;; esac\"]\n\n[fuzzing]\ntemplate = \"{}\"\ndelay_between_tests_seconds = 0.0",
            template.display()
        ),
    );

    let mut cmd = cargo_bin_cmd!("sipfuzz");
    cmd.arg("--fuzz").arg("--config").arg(&config);
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("[*] Total tests: 3"));

    let out_dir = temp.path().join("out");
    let report = report_in(&out_dir, "fuzzing_results_");
    assert_eq!(report["total_tests"], 3);
    assert_eq!(report["failed_tests"], 1);
    assert_eq!(report["crash_cases"], 1);
    assert_eq!(report["results"][1]["case_id"], "case_b");
    assert_eq!(report["results"][1]["outcome"]["exit_code"], 3);

    let crash_files = std::fs::read_dir(out_dir.join("crashes"))
        .expect("crashes dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert!(crash_files.iter().any(|name| name.ends_with("_0001.json")));
    assert!(crash_files.iter().any(|name| name.ends_with("_0001.xml")));
}

#[cfg(unix)]
#[test]
fn baseline_reports_crashes_from_a_live_device_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let template = temp.path().join("register.xml");
    std::fs::write(&template, "<scenario/>").expect("template");
    let config = write_config(
        temp.path(),
        "[runner]\nprogram = \"true\"\nargs = []\n\n[monitor]\nenabled = true\nsettle_seconds = 1\ncommand = { program = \"sh\", args = [\"-c\", \"echo 'F libc: Fatal signal 11 (SIGSEGV)'; sleep 30\"] }\nclear_command = { program = \"true\" }",
    );

    let mut cmd = cargo_bin_cmd!("sipfuzz");
    cmd.arg("--baseline")
        .arg("--config")
        .arg(&config)
        .arg("--template")
        .arg(&template);
    cmd.assert().success();

    let out_dir = temp.path().join("out");
    let report = report_in(&out_dir, "baseline_result_");
    let crashes = report["crashes"].as_array().expect("crashes");
    let names = crashes
        .iter()
        .map(|c| c["signature_name"].as_str().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Native Crash", "Segfault"]);
    assert_eq!(report["monitoring"]["sessions"].as_array().map(Vec::len), Some(1));

    let capture = report_in_text(&out_dir.join("logcat"), "logcat_baseline_");
    assert!(capture.contains("Fatal signal 11"));
}

#[cfg(unix)]
fn report_in_text(dir: &Path, prefix: &str) -> String {
    let entry = std::fs::read_dir(dir)
        .expect("dir")
        .filter_map(Result::ok)
        .find(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
        .unwrap_or_else(|| panic!("no {prefix} file in {}", dir.display()));
    std::fs::read_to_string(entry.path()).expect("read")
}
