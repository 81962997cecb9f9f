use std::fs;

use pipewright_core::config::PipewrightConfig;
use pipewright_flow::checkpoint::{CheckpointReader, CheckpointSelector};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &PipewrightConfig) {
    let mut checks = Vec::new();

    // 1. Checkpoint root exists and writable
    checks.push(check_root(config));

    // 2. Every flow's checkpoints parse and `latest` resolves
    checks.extend(check_flows(config));

    // 3. Retry and agent bounds are sane
    checks.push(check_retry(config));
    checks.push(check_agent(config));

    // Print results
    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_root(config: &PipewrightConfig) -> CheckResult {
    let root = config.checkpoint.root_path();
    if !root.is_dir() {
        return CheckResult {
            label: "Checkpoint root".into(),
            ok: false,
            detail: format!("{} does not exist", root.display()),
        };
    }

    // Check writable by attempting to create a temp file
    let test_file = root.join(".doctor_test");
    match fs::write(&test_file, "test") {
        Ok(_) => {
            let _ = fs::remove_file(&test_file);
            CheckResult {
                label: "Checkpoint root".into(),
                ok: true,
                detail: format!("{} (writable)", root.display()),
            }
        }
        Err(e) => CheckResult {
            label: "Checkpoint root".into(),
            ok: false,
            detail: format!("{} not writable: {}", root.display(), e),
        },
    }
}

fn check_flows(config: &PipewrightConfig) -> Vec<CheckResult> {
    let dir = config.checkpoint.root_path().join("checkpoints");
    let Ok(entries) = fs::read_dir(&dir) else {
        return vec![CheckResult {
            label: "Checkpoints".into(),
            ok: true,
            detail: "none saved yet".into(),
        }];
    };

    let reader = CheckpointReader::from_config(&config.checkpoint);
    let mut results = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let flow = entry.file_name().to_string_lossy().into_owned();
        let label = format!("Flow '{}'", flow);

        let summaries = match reader.list(&flow) {
            Ok(s) => s,
            Err(e) => {
                results.push(CheckResult {
                    label,
                    ok: false,
                    detail: e.to_string(),
                });
                continue;
            }
        };
        let latest = reader.resolve(&flow, &CheckpointSelector::AutoDetect);
        let stale = summaries
            .iter()
            .filter(|s| {
                (chrono::Utc::now() - s.timestamp).num_days()
                    > config.checkpoint.max_age_days as i64
            })
            .count();

        results.push(match latest {
            Ok(path) => CheckResult {
                label,
                ok: true,
                detail: format!(
                    "{} checkpoint(s), {} stale, latest {}",
                    summaries.len(),
                    stale,
                    path.file_name().map_or_else(
                        || path.display().to_string(),
                        |n| n.to_string_lossy().into_owned()
                    )
                ),
            },
            Err(e) => CheckResult {
                label,
                ok: false,
                detail: e.to_string(),
            },
        });
    }
    results
}

fn check_retry(config: &PipewrightConfig) -> CheckResult {
    let retry = &config.retry;
    let total_wait_ms = retry.wait_ms.saturating_mul(retry.max_retries as u64);
    CheckResult {
        label: "Retry policy".into(),
        ok: total_wait_ms <= 10 * 60 * 1000,
        detail: format!(
            "{} retries, {}ms wait ({}ms worst case per step)",
            retry.max_retries, retry.wait_ms, total_wait_ms
        ),
    }
}

fn check_agent(config: &PipewrightConfig) -> CheckResult {
    let max = config.agent.max_iterations;
    CheckResult {
        label: "Agent loop".into(),
        ok: max > 0,
        detail: if max > 0 {
            format!("max_iterations = {}", max)
        } else {
            "max_iterations = 0, agent loops will never run a tool".into()
        },
    }
}
