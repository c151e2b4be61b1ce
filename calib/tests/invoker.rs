mod common;

use calib::invoker::{DcSim, SimulationError, SimulationRequest, Simulator};
use common::{fake_simulator, CSV_HEADER};
use job_traces::Hitrate;
use platform_params::{CacheMedium, NetworkTier, ParameterSpace, Scenario};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn request(scratch: &Path) -> SimulationRequest {
    SimulationRequest {
        scenario: Scenario::new(CacheMedium::Ram, NetworkTier::Fast),
        assignment: ParameterSpace::default().sample(&mut StdRng::seed_from_u64(7)),
        workload: "test".into(),
        dataset_config: "ds.json".into(),
        workload_config: "wl.json".into(),
        hitrate: Hitrate::new(0.5).unwrap(),
        platform: scratch.join("platform.xml"),
        xrootd_flops: "1000.00".into(),
        scratch_dir: scratch.to_path_buf(),
        keep_output: None,
    }
}

fn scratch_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

fn writes_csv() -> String {
    format!(
        "cat > \"$out\" <<CSV\n{}\njob_1,\tsg01,\t0,\t100,\t80,\t5,\t1\njob_2,\tsg01,\t5,\t50,\t20,\t5,\t1\nsetup__x,\tsg01,\t0,\t1,\t1,\t0,\t0\njob_3,\tsg02,\t0,\t10,\t5,\t1,\t1\nCSV",
        CSV_HEADER
    )
}

#[tokio::test]
async fn test_parses_output_and_removes_it() {
    let bin = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let program = fake_simulator(bin.path(), "dc-sim", &writes_csv());

    let traces = DcSim::new(program)
        .run(&request(scratch.path()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(traces.len(), 3);
    assert_eq!(traces.records("sg01").len(), 2);
    assert_eq!(traces.records("sg01")[0].walltime(), 100.0);
    assert_eq!(traces.internal_rows, 1);
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn test_keeps_output_when_asked() {
    let bin = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let keep = tempfile::tempdir().unwrap();
    let program = fake_simulator(bin.path(), "dc-sim", &writes_csv());

    let mut req = request(scratch.path());
    let dest = keep.path().join("deep/dir/synthetic_hitrate_0.5.csv");
    req.keep_output = Some(dest.clone());
    DcSim::new(program).run(&req, CancellationToken::new()).await.unwrap();
    assert!(std::fs::read_to_string(&dest).unwrap().contains("job_1"));
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn test_non_zero_exit_carries_output() {
    let bin = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let program = fake_simulator(bin.path(), "dc-sim", "echo progress\necho boom >&2\nexit 3");

    let err = DcSim::new(program)
        .run(&request(scratch.path()), CancellationToken::new())
        .await
        .unwrap_err();
    match &err {
        SimulationError::Process { stdout, stderr, .. } => {
            assert_eq!(stdout.trim(), "progress");
            assert_eq!(stderr.trim(), "boom");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn test_empty_output_file() {
    let bin = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let program = fake_simulator(bin.path(), "dc-sim", ": > \"$out\"\necho nothing to do >&2");

    let err = DcSim::new(program)
        .run(&request(scratch.path()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SimulationError::EmptyOutput { .. }), "{:?}", err);
    assert_eq!(err.output().map(|(_, e)| e.trim()), Some("nothing to do"));
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn test_timeout_kills_simulator() {
    let bin = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let program = fake_simulator(bin.path(), "dc-sim", "exec sleep 30");

    let started = Instant::now();
    let err = DcSim::new(program)
        .with_timeout(Some(Duration::from_millis(200)))
        .run(&request(scratch.path()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SimulationError::Timeout(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(scratch_is_empty(scratch.path()));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancel_terminates_process() {
    let bin = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let pid_file = bin.path().join("pid");
    let program = fake_simulator(
        bin.path(),
        "dc-sim",
        &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watched = pid_file.clone();
    tokio::spawn(async move {
        while !watched.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let req = request(scratch.path());
    let err = DcSim::new(program).run(&req, cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists(), "simulator {} still alive", pid.trim());
    assert!(scratch_is_empty(scratch.path()));
}

/// Running (not zombie) process with this pid
#[cfg(target_os = "linux")]
fn running(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid.trim())) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map_or(false, |state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_wrapper_children() {
    let bin = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let pid_file = bin.path().join("grandchild");
    let program = fake_simulator(
        bin.path(),
        "dc-sim",
        &format!("sleep 30 &\necho $! > {}\nwait", pid_file.display()),
    );

    let err = DcSim::new(program)
        .with_timeout(Some(Duration::from_millis(300)))
        .run(&request(scratch.path()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SimulationError::Timeout(_)), "{:?}", err);

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while running(&pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!running(&pid), "wrapper child {} survived the timeout", pid.trim());
    assert!(scratch_is_empty(scratch.path()));
}
