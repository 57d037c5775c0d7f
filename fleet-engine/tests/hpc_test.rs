// Integration tests for batch-scheduler deployment through a login node

mod common;

use common::{package_catalog, test_settings, FakeHost, FakeShell, PACKAGE_DIR};
use fleet_common::FleetError;
use fleet_engine::HpcDeployment;
use std::sync::Arc;

fn login_node() -> (Arc<FakeHost>, FakeShell) {
    fleet_engine::logger::init_for_tests();
    let host = Arc::new(FakeHost::new("login.hpc.example"));
    (host.clone(), FakeShell::on(host))
}

#[tokio::test]
async fn test_prepare_then_submit_workers() {
    let (host, shell) = login_node();
    host.respond_to("sbatch ", "Submitted batch job 90{n}\n");
    let hpc = HpcDeployment::new(test_settings());
    let mut catalog = package_catalog();

    let (sync, _) = hpc.prepare(&shell, &mut catalog).await.unwrap();
    assert_eq!(sync.uploaded.len(), 2);
    assert!(catalog.all_deployed());

    let jobs = hpc.submit_workers(&shell, 2, "login.hpc.example:11000").await.unwrap();

    assert_eq!(
        jobs.iter().map(|j| j.job_id.as_str()).collect::<Vec<_>>(),
        vec!["901", "902"]
    );
    assert_eq!(jobs[0].management_port, 11001);
    assert_eq!(jobs[1].management_port, 11002);

    let submits = host.execs_containing("sbatch ");
    assert_eq!(submits.len(), 2);
    assert!(submits[0].contains(&format!("--job-name={}", jobs[0].job_name)));
    assert!(submits[0].contains(&format!("--output={}/{}.out", PACKAGE_DIR, jobs[0].job_name)));
    assert!(submits[0].contains("--coordinator login.hpc.example:11000"));
    assert!(submits[0].contains("--wrap '"));
}

#[tokio::test]
async fn test_unexpected_submit_output_is_an_error() {
    let (host, shell) = login_node();
    host.respond_to("sbatch ", "sbatch: error: invalid partition specified\n");
    let hpc = HpcDeployment::new(test_settings());

    let err = hpc.submit_workers(&shell, 1, "login:11000").await.unwrap_err();

    assert!(matches!(err, FleetError::Transport { .. }));
}

#[tokio::test]
async fn test_cancel_uses_one_scheduler_call() {
    let (host, shell) = login_node();
    host.respond_to("sbatch ", "Submitted batch job {n}\n");
    let hpc = HpcDeployment::new(test_settings());
    let jobs = hpc.submit_workers(&shell, 3, "login:11000").await.unwrap();

    hpc.cancel(&shell, &jobs).await.unwrap();
    hpc.cancel(&shell, &[]).await.unwrap();

    assert_eq!(host.execs_containing("scancel"), vec!["scancel 1 2 3".to_string()]);
}
