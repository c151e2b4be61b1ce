mod common;

use calib::coordinator::Coordinator;
use calib::invoker::DcSim;
use calib::trial::{InvalidReason, TrialOutcome};
use common::{fake_simulator, hitrates, model_reference, runner, workloads, ModelSimulator};
use platform_params::{CacheMedium, Param, ParameterAssignment, ParameterSpace, Scenario};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HITRATES: [f64; 3] = [1.0, 0.5, 0.0];

/// Every speed at 1e9, so all scenarios weigh the same
fn truth() -> ParameterAssignment {
    let values = Param::ALL.iter().map(|p| (*p, 1e9)).collect();
    ParameterSpace::default().assignment(&values).unwrap()
}

fn coordinator() -> Coordinator {
    Coordinator::new(4, None, Duration::from_secs(1))
}

#[tokio::test]
async fn test_truth_has_zero_loss() {
    let truth = truth();
    let simulator = Arc::new(ModelSimulator::new());
    let reference = model_reference(&truth, &workloads(), &hitrates(&HITRATES));
    let runner = runner(simulator.clone(), coordinator(), ParameterSpace::default(), reference, &HITRATES);

    match runner.evaluate(&truth, None).await {
        TrialOutcome::Success { loss, report } => {
            assert_eq!(loss, 0.0);
            // 4 scenarios x 3 hitrates x 2 machines
            assert_eq!(report.compared_groups, 24);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(simulator.calls(), runner.units_per_trial());
    assert_eq!(runner.units_per_trial(), 12);
}

#[tokio::test]
async fn test_early_rejection_skips_scenarios() {
    let space = ParameterSpace::default();
    let truth = truth();
    let far = space.with_value(&truth, Param::CpuSpeed, truth.get(Param::CpuSpeed) / 8.0);
    let reference = model_reference(&truth, &workloads(), &hitrates(&HITRATES));

    let full = Arc::new(ModelSimulator::new());
    let full_runner = runner(full.clone(), coordinator(), space.clone(), reference.clone(), &HITRATES);
    let final_loss = full_runner.evaluate(&far, None).await.loss();
    assert!(final_loss > 0.0);

    let staged = Arc::new(ModelSimulator::new());
    let staged_runner = runner(staged.clone(), coordinator(), space, reference, &HITRATES);
    match staged_runner.evaluate(&far, Some(final_loss / 100.0)).await {
        TrialOutcome::Rejected {
            partial_loss,
            completed_scenarios,
        } => {
            assert_eq!(completed_scenarios, 1);
            assert!(partial_loss > final_loss / 100.0);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(staged.calls() < full.calls());
    assert_eq!(staged.calls(), HITRATES.len());
}

#[tokio::test]
async fn test_threshold_above_loss_completes() {
    let space = ParameterSpace::default();
    let truth = truth();
    let near = space.with_value(&truth, Param::CpuSpeed, truth.get(Param::CpuSpeed) * 1.1);
    let reference = model_reference(&truth, &workloads(), &hitrates(&HITRATES));
    let simulator = Arc::new(ModelSimulator::new());
    let runner = runner(simulator.clone(), coordinator(), space, reference, &HITRATES);

    let outcome = runner.evaluate(&near, Some(1e6)).await;
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(simulator.calls(), 12);
}

#[tokio::test]
async fn test_failure_reports_scenario_and_output() {
    let truth = truth();
    let simulator = Arc::new(
        ModelSimulator::new()
            .with_delay(Duration::from_millis(20))
            .failing_when(|r| r.scenario.cache == CacheMedium::Disk && r.hitrate.value() == 0.5),
    );
    let reference = model_reference(&truth, &workloads(), &hitrates(&HITRATES));
    let runner = runner(simulator, coordinator(), ParameterSpace::default(), reference, &HITRATES);

    let outcome = runner.evaluate(&truth, None).await;
    assert_eq!(outcome.loss(), f64::INFINITY);
    let invalid = outcome.invalid().unwrap();
    assert_eq!(invalid.reason, InvalidReason::SimulationFailed);
    assert!(!invalid.failures.is_empty());
    for failure in &invalid.failures {
        assert_eq!(failure.scenario.cache, CacheMedium::Disk);
        assert_eq!(failure.workload, "test");
        assert_eq!(failure.stderr.as_deref(), Some("boom"));
    }
}

#[tokio::test]
async fn test_empty_simulator_output_is_infinite_loss() {
    let bin = tempfile::tempdir().unwrap();
    let program = fake_simulator(bin.path(), "dc-sim", ": > \"$out\"");
    let truth = truth();
    let reference = model_reference(&truth, &workloads(), &hitrates(&HITRATES));
    let runner = runner(
        Arc::new(DcSim::new(program)),
        coordinator(),
        ParameterSpace::default(),
        reference,
        &HITRATES,
    );

    let outcome = runner.evaluate(&truth, None).await;
    assert_eq!(outcome.loss(), f64::INFINITY);
    let invalid = outcome.invalid().unwrap();
    assert_eq!(invalid.reason, InvalidReason::SimulationFailed);
    assert!(invalid.failures[0].error.contains("empty"));
}

#[tokio::test]
async fn test_unmatched_reference_is_degenerate() {
    let truth = truth();
    // reference only knows a workload the runner never simulates
    let mut other = workloads();
    other[0].name = "copy".into();
    let reference = model_reference(&truth, &other, &hitrates(&HITRATES));
    let runner = runner(
        Arc::new(ModelSimulator::new()),
        coordinator(),
        ParameterSpace::default(),
        reference,
        &HITRATES,
    );

    let outcome = runner.evaluate(&truth, None).await;
    assert_eq!(outcome.invalid().map(|i| &i.reason), Some(&InvalidReason::DegenerateLoss));
    assert_eq!(outcome.loss(), f64::INFINITY);
}

#[tokio::test]
async fn test_scenario_subset() {
    let truth = truth();
    let simulator = Arc::new(ModelSimulator::new());
    let reference = model_reference(&truth, &workloads(), &hitrates(&HITRATES));
    let runner = runner(simulator.clone(), coordinator(), ParameterSpace::default(), reference, &HITRATES)
        .with_scenarios(vec![Scenario::CANONICAL[0]]);

    let set = runner.simulate(&truth, runner.scenarios(), None).await.unwrap();
    assert_eq!(set.scenarios().count(), 1);
    assert_eq!(simulator.calls(), 3);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_hard_deadline_kills_simulators() {
    let bin = tempfile::tempdir().unwrap();
    let pids = bin.path().join("pids");
    std::fs::create_dir(&pids).unwrap();
    let program = fake_simulator(
        bin.path(),
        "dc-sim",
        &format!("echo $$ > {}/$$\nexec sleep 30", pids.display()),
    );
    let truth = truth();
    let reference = model_reference(&truth, &workloads(), &hitrates(&HITRATES));
    let coordinator = Coordinator::new(3, Some(Duration::from_millis(500)), Duration::from_secs(2));
    let runner = runner(
        Arc::new(DcSim::new(program)),
        coordinator,
        ParameterSpace::default(),
        reference,
        &HITRATES,
    );

    let started = Instant::now();
    let outcome = runner.evaluate(&truth, None).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.invalid().map(|i| &i.reason), Some(&InvalidReason::Cancelled));

    let spawned: Vec<_> = std::fs::read_dir(&pids).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert!(!spawned.is_empty());
    assert!(spawned.len() <= 3);
    for pid in spawned {
        let proc_dir = std::path::Path::new("/proc").join(&pid);
        assert!(!proc_dir.exists(), "simulator {:?} leaked", pid);
    }
}
