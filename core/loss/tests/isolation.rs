use job_traces::{GroupIndex, GroupKey, Hitrate, JobRecord, TraceSet};
use platform_params::Scenario;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;
use trace_loss::{
    Frame, FrameKind, IsolationError, LossEvaluator, LossReport, LossRequest, LossWorkerPool, Metric,
};

const WORKER: &str = env!("CARGO_BIN_EXE_loss-worker");

fn traces(scale: f64) -> TraceSet {
    let mut set = TraceSet::new();
    for (i, scenario) in Scenario::CANONICAL.into_iter().enumerate() {
        let mut index = GroupIndex::new();
        for machine in ["sg01", "sg02"] {
            let records = (0..6)
                .map(|j| {
                    let wall = scale * (30.0 + 5.0 * (i + j) as f64);
                    JobRecord {
                        start: 0.0,
                        end: wall,
                        compute_time: wall * 0.7,
                        input_transfer_time: 2.0,
                        output_transfer_time: 1.0,
                        machine_name: machine.to_string(),
                        job_tag: format!("job_{}", j),
                    }
                })
                .collect::<Vec<_>>();
            index.insert(GroupKey::new("test", machine, Hitrate::new(0.5).unwrap()), records);
        }
        set.insert(scenario, index);
    }
    set
}

fn request(metric: Metric) -> LossRequest {
    LossRequest {
        metric,
        reference: traces(1.0),
        simulated: traces(1.25),
    }
}

#[tokio::test]
async fn test_isolated_matches_in_process() {
    let pool = LossWorkerPool::new(WORKER, 2, Duration::from_secs(30));
    for metric in Metric::ALL {
        let req = request(metric);
        let isolated = pool.evaluate(&req).await.unwrap();
        let local = req.evaluate();
        // records cross a JSON boundary, allow for last-digit float drift
        let tolerance = 1e-9 * local.loss().abs().max(1.0);
        assert!((isolated.loss() - local.loss()).abs() <= tolerance, "{}", metric);
        assert_eq!(isolated.compared_groups, local.compared_groups);
        assert_eq!(isolated.compared_groups, 8);
    }
}

#[tokio::test]
async fn test_isolated_is_idempotent() {
    let pool = std::sync::Arc::new(LossWorkerPool::new(WORKER, 4, Duration::from_secs(30)));
    let evaluator = LossEvaluator::Isolated {
        metric: Metric::Energy,
        pool,
    };
    let reference = traces(1.0);
    let simulated = traces(0.8);
    let first = evaluator.evaluate(&reference, &simulated).await.unwrap();
    let second = evaluator.evaluate(&reference, &simulated).await.unwrap();
    assert_eq!(first, second);
    assert!(first.loss() > 0.0);
}

#[tokio::test]
async fn test_degenerate_report_crosses_process_boundary() {
    let pool = LossWorkerPool::new(WORKER, 1, Duration::from_secs(30));
    let req = LossRequest {
        metric: Metric::Hausdorff,
        reference: traces(1.0),
        simulated: TraceSet::new(),
    };
    let report = pool.evaluate(&req).await.unwrap();
    assert!(report.is_degenerate());
    assert_eq!(report.loss(), f64::INFINITY);
}

#[test]
fn test_worker_rejects_corrupt_frame() {
    let mut bytes = Frame::encode(FrameKind::Request, &request(Metric::Mre)).unwrap().to_bytes();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x55;

    let mut child = Command::new(WORKER)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(&bytes).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[tokio::test]
async fn test_worker_failure_is_reported() {
    // A shell script standing in for a crashing worker
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("crash.sh");
    std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho boom >&2\nexit 3\n").unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&script, perms).unwrap();

    let pool = LossWorkerPool::new(&script, 1, Duration::from_secs(30));
    match pool.evaluate(&request(Metric::Mre)).await {
        Err(IsolationError::Worker { stderr, .. }) => assert!(stderr.contains("boom")),
        other => panic!("unexpected {:?}", other.map(|r: LossReport| r.loss())),
    }
}

#[tokio::test]
async fn test_worker_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("hang.sh");
    std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&script, perms).unwrap();

    let pool = LossWorkerPool::new(&script, 1, Duration::from_millis(200));
    let started = std::time::Instant::now();
    let result = pool.evaluate(&request(Metric::Mre)).await;
    assert!(matches!(result, Err(IsolationError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(10));
}
