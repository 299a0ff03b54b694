//! End-to-end scheduler scenarios.
//!
//! Drives a `ServiceScheduler` with hand-built offers and status updates
//! against a recording driver. Restarts build a fresh scheduler over the
//! same persister, the way a relaunched process would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use stagehand_core::ids::new_resource_id;
use stagehand_core::{
    CPUS, DISK, GoalState, MEM, Offer, Operation, OperationKind, PodSpec, RecoveryType, Reservation,
    Resource, ServiceSpec, TaskSpec, TaskState, TaskStatus,
};
use stagehand_plan::{Plan, PlanCustomizer, Status, StepKind};
use stagehand_scheduler::*;
use stagehand_state::{MemPersister, Persister};

// ── Fixtures ───────────────────────────────────────────────────────

const EXECUTOR_CPUS: f64 = 0.1;
const EXECUTOR_MEM: f64 = 32.0;
const EXECUTOR_DISK: f64 = 256.0;

fn pod_a(count: u32, cpus: f64) -> PodSpec {
    PodSpec::new("POD-A", count).with_task(
        TaskSpec::new("A", "echo A", cpus, 1000.0).with_volume("test-container-path", 1500.0),
    )
}

fn pod_b(count: u32, mem: f64) -> PodSpec {
    PodSpec::new("POD-B", count).with_task(
        TaskSpec::new("B", "echo B", 2.0, mem).with_volume("test-container-path", 2500.0),
    )
}

fn service(a: PodSpec, b: PodSpec) -> ServiceSpec {
    ServiceSpec::new("test-service").with_pod(a).with_pod(b)
}

fn default_service() -> ServiceSpec {
    service(pod_a(1, 1.0), pod_b(2, 2000.0))
}

fn unreserved_offer(id: &str, cpus: f64, mem: f64, disk: f64) -> Offer {
    Offer::new(
        id,
        "agent-1",
        vec![
            Resource::scalar(CPUS, cpus),
            Resource::scalar(MEM, mem),
            Resource::scalar(DISK, disk),
        ],
    )
}

fn sufficient_for_a(id: &str) -> Offer {
    unreserved_offer(id, 1.0 + EXECUTOR_CPUS, 1000.0 + EXECUTOR_MEM, 1500.0 + EXECUTOR_DISK)
}

fn sufficient_for_b(id: &str) -> Offer {
    unreserved_offer(id, 2.0 + EXECUTOR_CPUS, 2000.0 + EXECUTOR_MEM, 2500.0 + EXECUTOR_DISK)
}

fn insufficient_for_a(id: &str) -> Offer {
    unreserved_offer(id, 0.5, 500.0, 1500.0 + EXECUTOR_DISK)
}

fn orphan(name: &str, amount: f64) -> Resource {
    let spec = default_service();
    Resource::scalar(name, amount).with_reservation(Reservation {
        role: spec.role,
        principal: spec.principal,
        resource_id: new_resource_id(),
        resource_set: None,
    })
}

/// Reserved resources a launch batch left behind: task resources plus the
/// executor's.
fn launched_resources(operations: &[Operation]) -> Vec<Resource> {
    operations
        .iter()
        .find_map(|op| match op {
            Operation::LaunchGroup { executor, tasks } => Some(
                tasks
                    .iter()
                    .flat_map(|t| t.resources.clone())
                    .chain(executor.resources.clone())
                    .collect(),
            ),
            _ => None,
        })
        .expect("batch has a LAUNCH_GROUP")
}

fn kinds(operations: &[Operation]) -> Vec<OperationKind> {
    operations.iter().map(Operation::kind).collect()
}

fn count_kind(operations: &[Operation], kind: OperationKind) -> usize {
    operations.iter().filter(|op| op.kind() == kind).count()
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    persister: Arc<dyn Persister>,
    driver: RecordingDriver,
    scheduler: ServiceScheduler,
}

impl Harness {
    fn new(spec: ServiceSpec) -> Self {
        Self::with_config(spec, SchedulerConfig::default())
    }

    fn with_config(spec: ServiceSpec, config: SchedulerConfig) -> Self {
        let persister: Arc<dyn Persister> = Arc::new(MemPersister::new());
        let driver = RecordingDriver::new();
        let mut scheduler = SchedulerBuilder::new(spec, persister.clone())
            .with_config(config)
            .build(Arc::new(driver.clone()))
            .unwrap();
        scheduler.registered("test-framework", false).unwrap();
        Self {
            persister,
            driver,
            scheduler,
        }
    }

    /// Replace the scheduler with a freshly built one over the same state.
    fn restart(&mut self, builder: impl FnOnce(Arc<dyn Persister>) -> SchedulerBuilder) {
        self.driver.clear();
        self.scheduler = builder(self.persister.clone())
            .build(Arc::new(self.driver.clone()))
            .unwrap();
        self.scheduler.registered("test-framework", true).unwrap();
    }

    fn restart_with(&mut self, spec: ServiceSpec) {
        self.restart(|persister| SchedulerBuilder::new(spec, persister));
    }

    fn step_statuses(&self) -> Vec<Status> {
        self.scheduler
            .deploy_plan()
            .unwrap()
            .steps()
            .map(|s| s.status())
            .collect()
    }

    fn task_id(&self, name: &str) -> String {
        self.scheduler
            .state()
            .fetch_task(name)
            .unwrap()
            .unwrap()
            .task_id
    }

    fn send_status(&mut self, name: &str, state: TaskState) {
        let status = TaskStatus::new(&self.task_id(name), state);
        self.scheduler.status(status).unwrap();
    }

    /// Deliver `offer`, expect it to be accepted, and return the batch.
    fn launch(&mut self, offer: Offer) -> Vec<Operation> {
        let before = self.driver.accepts().len();
        self.scheduler.offers(vec![offer]).unwrap();
        let accepts = self.driver.accepts();
        assert_eq!(accepts.len(), before + 1, "offer was not accepted");
        accepts[before].1.clone()
    }

    /// Launch A0, B0 and B1 and bring each to RUNNING.
    fn install_all(&mut self) -> Vec<Vec<Operation>> {
        let a = self.launch(sufficient_for_a("offer-a"));
        self.send_status("POD-A-0-A", TaskState::Running);
        let b0 = self.launch(sufficient_for_b("offer-b0"));
        self.send_status("POD-B-0-B", TaskState::Running);
        let b1 = self.launch(sufficient_for_b("offer-b1"));
        self.send_status("POD-B-1-B", TaskState::Running);
        vec![a, b0, b1]
    }

    /// Finish reconciliation by redelivering the stored status of `names`.
    fn reconcile(&mut self, names: &[&str]) {
        self.scheduler.offers(Vec::new()).unwrap();
        for name in names {
            self.send_status(name, TaskState::Running);
        }
        self.scheduler.offers(Vec::new()).unwrap();
        assert!(self.scheduler.is_reconciled());
    }
}

#[derive(Default)]
struct CountingCustomizer {
    deploy: AtomicUsize,
    recovery: AtomicUsize,
    decommission: AtomicUsize,
}

impl PlanCustomizer for CountingCustomizer {
    fn update_deploy_plan(&self, plan: Plan) -> Plan {
        self.deploy.fetch_add(1, Ordering::SeqCst);
        plan
    }

    fn update_recovery_plan(&self, plan: Plan) -> Plan {
        self.recovery.fetch_add(1, Ordering::SeqCst);
        plan
    }

    fn update_decommission_plan(&self, plan: Plan) -> Plan {
        self.decommission.fetch_add(1, Ordering::SeqCst);
        plan
    }
}

use Status::{Complete, Pending, Prepared, Starting};

// ── Deployment ─────────────────────────────────────────────────────

#[test]
fn empty_offers_make_no_driver_decisions() {
    let mut h = Harness::new(default_service());
    h.scheduler.offers(Vec::new()).unwrap();

    assert!(h.driver.accepts().is_empty());
    assert!(h.driver.declines().is_empty());
    assert_eq!(h.step_statuses(), vec![Pending, Pending, Pending]);
}

#[test]
fn sufficient_offer_launches_a() {
    let mut h = Harness::new(default_service());
    let operations = h.launch(sufficient_for_a("offer-a"));

    assert_eq!(operations.len(), 8);
    assert_eq!(count_kind(&operations, OperationKind::Reserve), 6);
    assert_eq!(count_kind(&operations, OperationKind::Create), 1);
    assert_eq!(kinds(&operations).last(), Some(&OperationKind::LaunchGroup));
    assert_eq!(h.step_statuses(), vec![Starting, Pending, Pending]);

    h.send_status("POD-A-0-A", TaskState::Running);
    assert_eq!(h.step_statuses(), vec![Complete, Pending, Pending]);
}

#[test]
fn launched_tasks_have_info_and_status() {
    let mut h = Harness::new(default_service());
    h.launch(sufficient_for_a("offer-a"));

    let state = h.scheduler.state();
    let info = state.fetch_task("POD-A-0-A").unwrap().unwrap();
    let status = state.fetch_status("POD-A-0-A").unwrap().unwrap();
    assert_eq!(status.task_id, info.task_id);
    assert_eq!(status.state, TaskState::Staging);
    assert_eq!(info.target_config, h.scheduler.target_id());
}

#[test]
fn b_launches_after_a() {
    let mut h = Harness::new(default_service());
    h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);

    let operations = h.launch(sufficient_for_b("offer-b"));
    assert_eq!(operations.len(), 8);
    h.send_status("POD-B-0-B", TaskState::Running);
    assert_eq!(h.step_statuses(), vec![Complete, Complete, Pending]);
}

#[test]
fn insufficient_offer_is_declined() {
    let mut h = Harness::new(default_service());
    h.scheduler.offers(vec![insufficient_for_a("small")]).unwrap();

    assert!(h.driver.accepts().is_empty());
    let declines = h.driver.declines();
    assert_eq!(declines.len(), 1);
    assert_eq!(declines[0].0, "small");
    assert_eq!(h.step_statuses(), vec![Prepared, Pending, Pending]);
}

#[test]
fn one_batch_per_offer() {
    let mut h = Harness::new(default_service());
    h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);

    // Big enough for both B instances, but B's phase is serial.
    let big = unreserved_offer("big", 10.0, 10_000.0, 10_000.0);
    h.scheduler.offers(vec![big]).unwrap();
    let accepts = h.driver.accepts();
    assert_eq!(accepts.len(), 2);
    assert_eq!(accepts[1].0, vec!["big".to_string()]);
    assert!(h.driver.declines().is_empty());
}

// ── Config updates ─────────────────────────────────────────────────

#[test]
fn updated_a_restarts_only_a() {
    let mut h = Harness::new(default_service());
    h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);
    h.launch(sufficient_for_b("offer-b"));
    h.send_status("POD-B-0-B", TaskState::Running);

    h.restart_with(service(pod_a(1, 2.0), pod_b(2, 2000.0)));
    assert_eq!(h.step_statuses(), vec![Pending, Complete, Pending]);
}

#[test]
fn updated_b_restarts_only_b() {
    let mut h = Harness::new(default_service());
    h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);
    h.launch(sufficient_for_b("offer-b"));
    h.send_status("POD-B-0-B", TaskState::Running);

    h.restart_with(service(pod_a(1, 1.0), pod_b(2, 4000.0)));
    assert_eq!(h.step_statuses(), vec![Complete, Pending, Pending]);
}

#[test]
fn scaled_out_a_adds_a_step() {
    let mut h = Harness::new(default_service());
    h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);
    h.launch(sufficient_for_b("offer-b"));
    h.send_status("POD-B-0-B", TaskState::Running);

    h.restart_with(service(pod_a(2, 1.0), pod_b(2, 2000.0)));
    assert_eq!(h.step_statuses(), vec![Complete, Pending, Complete, Pending]);
}

#[test]
fn config_update_kills_then_relaunches_a() {
    let mut h = Harness::new(default_service());
    let launched = h.install_all();
    assert_eq!(h.step_statuses(), vec![Complete, Complete, Complete]);
    let old_a = h.task_id("POD-A-0-A");
    assert_eq!(h.scheduler.recovery_plan().unwrap().phases().len(), 0);

    h.restart_with(service(pod_a(1, 2.0), pod_b(2, 2000.0)));
    assert_eq!(h.step_statuses(), vec![Pending, Complete, Complete]);

    // Reconciliation is still outstanding: decline without killing.
    let delta = Offer::new("delta", "agent-1", vec![Resource::scalar(CPUS, 1.0)]);
    h.scheduler.offers(vec![delta.clone()]).unwrap();
    assert_eq!(h.driver.declines().len(), 1);
    assert!(h.driver.kills().is_empty());
    let explicit: Vec<_> = h
        .driver
        .reconciles()
        .into_iter()
        .filter(|r| !r.is_empty())
        .collect();
    assert_eq!(explicit.len(), 1);
    assert_eq!(explicit[0].len(), 3);

    for name in ["POD-A-0-A", "POD-B-0-B", "POD-B-1-B"] {
        h.send_status(name, TaskState::Running);
    }
    h.scheduler.offers(vec![delta]).unwrap();
    assert_eq!(h.driver.kills(), vec![old_a.clone()]);
    assert_eq!(h.driver.declines().len(), 2);
    assert_eq!(h.step_statuses(), vec![Prepared, Complete, Complete]);

    h.send_status("POD-A-0-A", TaskState::Killed);
    assert_eq!(h.step_statuses(), vec![Prepared, Complete, Complete]);
    assert_eq!(h.scheduler.recovery_plan().unwrap().phases().len(), 0);

    // The old reservations plus the extra cpu cover the new target.
    let mut resources = launched_resources(&launched[0]);
    resources.push(Resource::scalar(CPUS, 1.0));
    let operations = h.launch(Offer::new("full", "agent-1", resources));
    assert_eq!(
        kinds(&operations),
        vec![OperationKind::Reserve, OperationKind::LaunchGroup]
    );
    assert_eq!(h.step_statuses(), vec![Starting, Complete, Complete]);
    assert_eq!(h.scheduler.recovery_plan().unwrap().phases().len(), 0);

    let new_a = h.task_id("POD-A-0-A");
    assert_ne!(new_a, old_a);
    h.send_status("POD-A-0-A", TaskState::Running);
    assert_eq!(h.step_statuses(), vec![Complete, Complete, Complete]);
}

#[test]
fn rejected_shrink_keeps_target() {
    let mut h = Harness::new(default_service());
    let target = h.scheduler.target_id();

    h.scheduler
        .update_config(&service(pod_a(1, 1.0), pod_b(1, 2000.0)))
        .unwrap();

    assert_eq!(h.scheduler.target_id(), target);
    let plan = h.scheduler.deploy_plan().unwrap();
    assert_eq!(plan.errors().len(), 1);
    assert!(plan.errors()[0].contains("Transition: '2' => '1'"));
    assert_eq!(plan.status(), Status::Error);
    // Only the pod the rejected transition names is held in ERROR.
    assert_eq!(
        h.step_statuses(),
        vec![Status::Pending, Status::Error, Status::Error]
    );
}

#[test]
fn invalid_first_config_is_fatal() {
    let mut task = TaskSpec::new("G", "train", 1.0, 1000.0);
    task.resources.gpus = 1.0;
    let spec = ServiceSpec::new("gpu-service").with_pod(PodSpec::new("POD-G", 1).with_task(task));
    let result = SchedulerBuilder::new(spec, Arc::new(MemPersister::new()))
        .with_capabilities(Capabilities {
            supports_gpu_resources: false,
            supports_readiness_checks: true,
        })
        .build(Arc::new(RecordingDriver::new()));

    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
}

// ── Recovery and cleanup ───────────────────────────────────────────

#[test]
fn recovery_launch_and_cleanup_share_one_cycle() {
    let mut h = Harness::new(default_service());
    let a_batch = h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);
    h.send_status("POD-A-0-A", TaskState::Killed);

    let recovery = h.scheduler.recovery_plan().unwrap();
    assert_eq!(recovery.phases().len(), 1);
    assert_eq!(recovery.phases()[0].name(), "POD-A-0");

    let with_orphans = |mut offer: Offer| {
        offer.resources.push(orphan(CPUS, 1.0));
        offer.resources.push(orphan(MEM, 1.0));
        offer
    };
    let mut offer_a = Offer::new("offer-a2", "agent-1", launched_resources(&a_batch));
    offer_a = with_orphans(offer_a);
    let offer_b = with_orphans(sufficient_for_b("offer-b"));
    let offer_c = with_orphans(sufficient_for_b("offer-c"));

    h.driver.clear();
    h.scheduler.offers(vec![offer_a, offer_b, offer_c]).unwrap();

    let accepts = h.driver.accepts();
    assert_eq!(accepts.len(), 3);
    let mut recovered = false;
    let mut launched = false;
    let mut cleaned = false;
    for (offer_ids, operations) in &accepts {
        match operations.len() {
            1 => {
                assert_eq!(offer_ids, &vec!["offer-a2".to_string()]);
                assert_eq!(operations[0].kind(), OperationKind::LaunchGroup);
                recovered = true;
            }
            8 => {
                assert_eq!(offer_ids, &vec!["offer-b".to_string()]);
                launched = true;
            }
            2 => {
                assert_eq!(offer_ids, &vec!["offer-c".to_string()]);
                assert_eq!(count_kind(operations, OperationKind::Unreserve), 2);
                cleaned = true;
            }
            n => panic!("unexpected batch of {n} operations"),
        }
    }
    assert!(recovered && launched && cleaned);
    assert!(h.driver.declines().is_empty());
}

#[test]
fn failed_task_recovers_on_its_own_reservations() {
    let mut h = Harness::new(ServiceSpec::new("test-service").with_pod(pod_a(1, 1.0)));
    let batch = h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);
    h.send_status("POD-A-0-A", TaskState::Failed);

    let recovery = h.scheduler.recovery_plan().unwrap();
    let step = recovery.steps().next().unwrap();
    assert_eq!(
        step.kind(),
        StepKind::Launch {
            recovery: RecoveryType::Transient
        }
    );

    // A fresh offer and one holding the old reservations: the latter wins.
    let fresh = sufficient_for_a("fresh");
    let owned = Offer::new("owned", "agent-1", launched_resources(&batch));
    h.driver.clear();
    h.scheduler.offers(vec![fresh, owned]).unwrap();
    let accepts = h.driver.accepts();
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0].0, vec!["owned".to_string()]);

    h.send_status("POD-A-0-A", TaskState::Running);
    assert!(h.scheduler.recovery_plan().unwrap().is_complete());
}

#[test]
fn manual_strategy_skips_automatic_recovery() {
    let config = SchedulerConfig::default().with_recovery_strategy(RecoveryStrategy::Manual);
    let mut h = Harness::with_config(default_service(), config);
    h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);
    h.send_status("POD-A-0-A", TaskState::Failed);

    assert_eq!(h.scheduler.recovery_plan().unwrap().phases().len(), 0);
}

#[test]
fn finished_task_with_finish_goal_is_not_recovered() {
    let pod = PodSpec::new("POD-J", 1)
        .with_task(TaskSpec::new("job", "run-once", 0.5, 128.0).with_goal(GoalState::Finish));
    let mut h = Harness::new(ServiceSpec::new("jobs").with_pod(pod));
    h.launch(unreserved_offer("o", 1.0, 512.0, 512.0));
    h.send_status("POD-J-0-job", TaskState::Running);
    h.send_status("POD-J-0-job", TaskState::Finished);

    assert!(h.scheduler.deploy_plan().unwrap().is_complete());
    assert_eq!(h.scheduler.recovery_plan().unwrap().phases().len(), 0);
}

#[test]
fn replaced_pod_launches_on_fresh_reservations() {
    let mut h = Harness::new(default_service());
    let batch = h.launch(sufficient_for_a("offer-a"));
    h.send_status("POD-A-0-A", TaskState::Running);
    let old_a = h.task_id("POD-A-0-A");

    h.scheduler.replace_pod("POD-A-0").unwrap();
    assert_eq!(h.driver.kills(), vec![old_a]);
    // The kill is outstanding, so nothing is recovered yet.
    assert_eq!(h.scheduler.recovery_plan().unwrap().phases().len(), 0);

    h.send_status("POD-A-0-A", TaskState::Killed);
    let step = h.scheduler.recovery_plan().unwrap().steps().next().unwrap().clone();
    assert_eq!(
        step.kind(),
        StepKind::Launch {
            recovery: RecoveryType::Permanent
        }
    );

    let mut resources = launched_resources(&batch);
    resources.extend(sufficient_for_a("unused").resources);
    let operations = h.launch(Offer::new("mixed", "agent-1", resources));
    assert_eq!(operations.len(), 8);
    assert_eq!(count_kind(&operations, OperationKind::Reserve), 6);

    let property = h
        .scheduler
        .state()
        .fetch_property("POD-A-0-A", PERMANENTLY_FAILED_PROPERTY)
        .unwrap();
    assert_eq!(property, None);
}

#[test]
fn replacing_unknown_pod_fails() {
    let mut h = Harness::new(default_service());
    let err = h.scheduler.replace_pod("POD-A-0").unwrap_err();
    assert!(matches!(err, SchedulerError::PodNotFound(_)));
}

// ── Task status ────────────────────────────────────────────────────

#[test]
fn task_ip_is_stored_and_kept() {
    let mut h = Harness::new(default_service());
    h.launch(sufficient_for_a("offer-a"));
    let id = h.task_id("POD-A-0-A");

    h.scheduler
        .status(TaskStatus::new(&id, TaskState::Running).with_ip("9.9.9.9"))
        .unwrap();
    let ip = |h: &Harness| {
        h.scheduler
            .state()
            .fetch_status("POD-A-0-A")
            .unwrap()
            .unwrap()
            .ip_addresses()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    assert_eq!(ip(&h), vec!["9.9.9.9"]);

    h.scheduler
        .status(TaskStatus::new(&id, TaskState::Running).with_ip("1.1.1.1"))
        .unwrap();
    assert_eq!(ip(&h), vec!["1.1.1.1"]);

    h.scheduler
        .status(TaskStatus::new(&id, TaskState::Running))
        .unwrap();
    assert_eq!(ip(&h), vec!["1.1.1.1"]);
}

#[test]
fn status_for_stale_task_id_is_acknowledged_and_ignored() {
    let mut h = Harness::new(default_service());
    h.launch(sufficient_for_a("offer-a"));
    let stale = stagehand_core::ids::new_task_id("POD-A-0-A");

    h.scheduler
        .status(TaskStatus::new(&stale, TaskState::Running))
        .unwrap();
    assert!(h.driver.acknowledgements().contains(&stale));
    let stored = h.scheduler.state().fetch_status("POD-A-0-A").unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Staging);
    assert_eq!(h.step_statuses(), vec![Starting, Pending, Pending]);
}

#[test]
fn readiness_check_gates_completion() {
    let pod = PodSpec::new("POD-R", 1)
        .with_task(TaskSpec::new("web", "serve", 0.5, 128.0).with_readiness_check("curl -f localhost"));
    let mut h = Harness::new(ServiceSpec::new("web").with_pod(pod));
    h.launch(unreserved_offer("o", 1.0, 512.0, 512.0));
    let id = h.task_id("POD-R-0-web");

    h.scheduler
        .status(TaskStatus::new(&id, TaskState::Running))
        .unwrap();
    assert_eq!(h.step_statuses(), vec![Status::Started]);

    h.scheduler
        .status(TaskStatus::new(&id, TaskState::Running).with_readiness_passed())
        .unwrap();
    assert_eq!(h.step_statuses(), vec![Complete]);
}

#[test]
fn terminal_step_count_never_decreases() {
    let mut h = Harness::new(default_service());
    let terminal = |h: &Harness| {
        h.step_statuses()
            .into_iter()
            .filter(|s| s.is_complete() || *s == Status::Error)
            .count()
    };
    let mut seen = terminal(&h);
    let mut check = |h: &Harness| {
        let now = terminal(h);
        assert!(now >= seen, "terminal steps went from {seen} to {now}");
        seen = now;
    };

    h.scheduler.offers(vec![insufficient_for_a("small")]).unwrap();
    check(&h);
    h.launch(sufficient_for_a("offer-a"));
    check(&h);
    h.send_status("POD-A-0-A", TaskState::Staging);
    check(&h);
    h.send_status("POD-A-0-A", TaskState::Running);
    check(&h);
    h.scheduler.offers(Vec::new()).unwrap();
    check(&h);

    h.launch(sufficient_for_b("offer-b0"));
    check(&h);
    // Repeated and stale updates for a finished step change nothing.
    h.send_status("POD-A-0-A", TaskState::Running);
    check(&h);
    let stale = stagehand_core::ids::new_task_id("POD-A-0-A");
    h.scheduler
        .status(TaskStatus::new(&stale, TaskState::Starting))
        .unwrap();
    check(&h);
    h.send_status("POD-B-0-B", TaskState::Starting);
    check(&h);
    h.send_status("POD-B-0-B", TaskState::Running);
    check(&h);

    h.scheduler.offers(vec![insufficient_for_a("small-2")]).unwrap();
    check(&h);
    h.launch(sufficient_for_b("offer-b1"));
    check(&h);
    h.send_status("POD-B-1-B", TaskState::Running);
    check(&h);
    h.scheduler.offers(Vec::new()).unwrap();
    check(&h);

    assert_eq!(seen, 3);
}

// ── Decommission ───────────────────────────────────────────────────

#[test]
fn decommission_plan_goes_through_customizer() {
    let mut h = Harness::new(default_service());
    h.install_all();

    let customizer = Arc::new(CountingCustomizer::default());
    let shrunk = service(pod_a(1, 1.0), pod_b(1, 2000.0).with_decommission(true));
    let hook = customizer.clone();
    h.restart(move |persister| SchedulerBuilder::new(shrunk, persister).with_customizer(hook));

    assert!(customizer.decommission.load(Ordering::SeqCst) > 0);
    assert!(customizer.deploy.load(Ordering::SeqCst) > 0);
    assert!(customizer.recovery.load(Ordering::SeqCst) > 0);

    let plan = h.scheduler.decommission_plan().unwrap();
    assert_eq!(plan.phases().len(), 1);
    let phase = &plan.phases()[0];
    assert_eq!(phase.name(), "POD-B-1");
    let names: Vec<&str> = phase.steps().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["kill-POD-B-1", "unreserve-POD-B-1"]);
}

#[test]
fn decommission_kills_then_releases_reservations() {
    let mut h = Harness::new(default_service());
    let launched = h.install_all();
    let b1 = h.task_id("POD-B-1-B");

    h.restart_with(service(pod_a(1, 1.0), pod_b(1, 2000.0).with_decommission(true)));
    assert_eq!(h.step_statuses(), vec![Complete, Complete]);
    h.reconcile(&["POD-A-0-A", "POD-B-0-B", "POD-B-1-B"]);

    let filler = Offer::new("filler", "agent-1", vec![Resource::scalar(CPUS, 0.5)]);
    h.scheduler.offers(vec![filler]).unwrap();
    assert_eq!(h.driver.kills(), vec![b1]);
    assert!(h.driver.accepts().is_empty());

    h.send_status("POD-B-1-B", TaskState::Killed);
    // The decommissioned instance is not recovered.
    assert_eq!(h.scheduler.recovery_plan().unwrap().phases().len(), 0);

    let held = Offer::new("held", "agent-1", launched_resources(&launched[2]));
    h.scheduler.offers(vec![held]).unwrap();
    let accepts = h.driver.accepts();
    assert_eq!(accepts.len(), 1);
    let operations = &accepts[0].1;
    assert_eq!(count_kind(operations, OperationKind::Destroy), 1);
    assert_eq!(count_kind(operations, OperationKind::Unreserve), 6);
    assert_eq!(operations[0].kind(), OperationKind::Destroy);

    assert!(h.scheduler.state().fetch_task("POD-B-1-B").unwrap().is_none());
    assert!(h.scheduler.decommission_plan().unwrap().is_complete());
}
