//! ServiceScheduler — routes resource-manager callbacks into plans and state.
//!
//! # Offer cycle
//!
//! ```text
//! offers ──▶ reconciled? ──no──▶ decline all (short)
//!              │yes
//!              ▼
//!        refresh recovery ──▶ coordinator.candidates()
//!              │
//!              ├── Launch        precheck ──▶ satisfied | adopt | kill | evaluate ──▶ accept
//!              ├── Decommission  kill live tasks
//!              └── Cleanup       erase task records
//!              ▼
//!        orphan reservations ──▶ accept UNRESERVE/DESTROY
//!              ▼
//!        decline the rest (long when every plan is complete)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use stagehand_core::ids::task_name_from_id;
use stagehand_core::{
    ConfigId, Offer, RecoveryType, ServiceSpec, Strategy, TaskInfo, TaskState, TaskStatus,
};
use stagehand_offer::{OfferEvaluator, PodInstanceRequirement, ResourceCleaner, ServiceContext};
use stagehand_plan::{
    DECOMMISSION_PLAN, DEPLOY_PLAN, Plan, PlanCoordinator, PlanCustomizer, PlanKind, PlanManager,
    RECOVERY_PLAN, Step, StepKey, StepKind,
};
use stagehand_state::{ConfigStore, FrameworkStore, Persister, PersisterCache, StateStore};
use tracing::{debug, info, warn};

use crate::config::{Capabilities, SchedulerConfig};
use crate::config_manager::{ConfigManager, ConfigUpdate};
use crate::driver::SchedulerDriver;
use crate::error::{SchedulerError, SchedulerResult};
use crate::plans::{
    PERMANENTLY_FAILED_PROPERTY, RecoveryInputs, StoredTasks, decommission_plan, deploy_plan,
    recovery_plan, task_at_goal,
};
use crate::reconciler::Reconciler;
use crate::task_killer::TaskKiller;

/// What a launch step needs this cycle, judged from stored task state.
#[derive(Debug, PartialEq)]
enum LaunchAction {
    /// Every task is already at its goal under the target config.
    Satisfied,
    /// Current tasks are still on their way; track them (task name → id).
    Adopt(BTreeMap<String, String>),
    /// Outdated tasks are alive and must be killed first (task name → id).
    Kill(BTreeMap<String, String>),
    /// Kills were issued and have not been confirmed yet.
    AwaitKill,
    Launch,
}

// ── Builder ────────────────────────────────────────────────────────

pub struct SchedulerBuilder {
    spec: ServiceSpec,
    persister: Arc<dyn Persister>,
    config: SchedulerConfig,
    capabilities: Capabilities,
    customizer: Option<Arc<dyn PlanCustomizer>>,
}

impl SchedulerBuilder {
    pub fn new(spec: ServiceSpec, persister: Arc<dyn Persister>) -> Self {
        Self {
            spec,
            persister,
            config: SchedulerConfig::default(),
            capabilities: Capabilities::default(),
            customizer: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Rewrite every generated plan through `customizer` before installing it.
    pub fn with_customizer(mut self, customizer: Arc<dyn PlanCustomizer>) -> Self {
        self.customizer = Some(customizer);
        self
    }

    /// Publish the spec as the target config and generate the initial plans.
    ///
    /// Fails if the spec is rejected and no earlier target exists.
    pub fn build(self, driver: Arc<dyn SchedulerDriver>) -> SchedulerResult<ServiceScheduler> {
        let persister: Arc<dyn Persister> = if self.config.state_cache_enabled {
            Arc::new(PersisterCache::new(self.persister)?)
        } else {
            self.persister
        };
        let state = StateStore::new(persister.clone());
        let frameworks = FrameworkStore::new(persister.clone());
        let configs = ConfigManager::new(
            ConfigStore::json(persister),
            state.clone(),
            self.capabilities,
        );

        let update = configs.update(&self.spec)?;
        let coordinator = PlanCoordinator::new(vec![
            PlanManager::new(PlanKind::Recovery, Plan::new(RECOVERY_PLAN, Strategy::Parallel)),
            PlanManager::new(PlanKind::Deploy, Plan::new(DEPLOY_PLAN, Strategy::Serial)),
            PlanManager::new(PlanKind::Decommission, Plan::new(DECOMMISSION_PLAN, Strategy::Serial)),
        ]);

        let mut scheduler = ServiceScheduler {
            reconciler: Reconciler::new(self.config.reconcile_timeout()),
            killer: TaskKiller::new(self.config.background_kills_enabled),
            evaluator: OfferEvaluator::new(ServiceContext::from_spec(&update.target)),
            target_id: update.target_id,
            target: update.target.clone(),
            config: self.config,
            driver,
            state,
            frameworks,
            configs,
            customizer: self.customizer,
            coordinator,
            connected: false,
        };
        scheduler.apply_update(update)?;
        info!(
            service = %scheduler.target.name,
            config = %scheduler.target_id,
            "scheduler initialized"
        );
        Ok(scheduler)
    }
}

// ── Scheduler ──────────────────────────────────────────────────────

pub struct ServiceScheduler {
    config: SchedulerConfig,
    driver: Arc<dyn SchedulerDriver>,
    state: StateStore,
    frameworks: FrameworkStore,
    configs: ConfigManager,
    evaluator: OfferEvaluator,
    customizer: Option<Arc<dyn PlanCustomizer>>,
    coordinator: PlanCoordinator,
    reconciler: Reconciler,
    killer: TaskKiller,
    target_id: ConfigId,
    target: ServiceSpec,
    connected: bool,
}

impl ServiceScheduler {
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn target_id(&self) -> ConfigId {
        self.target_id
    }

    pub fn target(&self) -> &ServiceSpec {
        &self.target
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn coordinator(&self) -> &PlanCoordinator {
        &self.coordinator
    }

    pub fn plan(&self, kind: PlanKind) -> Option<&Plan> {
        self.coordinator.manager(kind).map(PlanManager::plan)
    }

    pub fn deploy_plan(&self) -> Option<&Plan> {
        self.plan(PlanKind::Deploy)
    }

    pub fn recovery_plan(&self) -> Option<&Plan> {
        self.plan(PlanKind::Recovery)
    }

    pub fn decommission_plan(&self) -> Option<&Plan> {
        self.plan(PlanKind::Decommission)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciler.is_reconciled()
    }

    fn customize(&self, kind: PlanKind, plan: Plan) -> Plan {
        let Some(customizer) = &self.customizer else {
            return plan;
        };
        match kind {
            PlanKind::Deploy => customizer.update_deploy_plan(plan),
            PlanKind::Recovery => customizer.update_recovery_plan(plan),
            PlanKind::Decommission => customizer.update_decommission_plan(plan),
        }
    }

    fn install(&mut self, kind: PlanKind, plan: Plan) {
        let plan = self.customize(kind, plan);
        if let Some(manager) = self.coordinator.manager_mut(kind) {
            manager.set_plan(plan);
        }
    }

    // ── Registration ───────────────────────────────────────────────

    /// The resource manager accepted (or re-accepted) the framework.
    pub fn registered(&mut self, framework_id: &str, reregistered: bool) -> SchedulerResult<()> {
        match self.frameworks.fetch_framework_id()? {
            Some(stored) if stored == framework_id => {}
            Some(stored) => {
                warn!(%stored, %framework_id, "framework id changed, storing the new one");
                self.frameworks.store_framework_id(framework_id)?;
            }
            None => self.frameworks.store_framework_id(framework_id)?,
        }
        info!(%framework_id, reregistered, "registered with resource manager");

        let known = self.state.fetch_statuses()?;
        self.reconciler.start(known, Instant::now());
        self.connected = true;
        Ok(())
    }

    pub fn disconnected(&mut self) {
        info!("disconnected from resource manager");
        self.connected = false;
    }

    pub fn rescinded(&mut self, offer_id: &str) {
        debug!(%offer_id, "offer rescinded");
    }

    // ── Offers ─────────────────────────────────────────────────────

    /// Run one offer cycle over `offers`.
    pub fn offers(&mut self, offers: Vec<Offer>) -> SchedulerResult<()> {
        if !self.connected {
            debug!(offers = offers.len(), "ignoring offers while disconnected");
            return Ok(());
        }
        self.reconciler.reconcile(self.driver.as_ref(), Instant::now());
        if offers.is_empty() {
            return Ok(());
        }
        if !self.reconciler.is_reconciled() {
            info!(
                offers = offers.len(),
                remaining = self.reconciler.remaining(),
                "declining offers until reconciliation completes"
            );
            self.decline(&offers, false);
            return Ok(());
        }

        self.refresh_recovery()?;
        let mut pool = offers;
        let candidates = self.coordinator.candidates();
        let tasks = StoredTasks::load(&self.state)?;
        for &key in &candidates {
            let step = self
                .coordinator
                .step(key)
                .ok_or_else(|| SchedulerError::Internal(format!("candidate step {key:?} not found")))?;
            match step.kind() {
                StepKind::Launch { recovery } => {
                    if pool.is_empty() {
                        continue;
                    }
                    self.process_launch(key, recovery, &tasks, &mut pool)?;
                }
                StepKind::Decommission => self.process_decommission(key, &tasks)?,
                StepKind::Cleanup => self.process_cleanup(key)?,
                StepKind::NoOp => {}
            }
        }

        if !pool.is_empty() {
            self.clean_reservations(&mut pool)?;
        }

        let idle = candidates.is_empty()
            && self
                .coordinator
                .managers()
                .iter()
                .all(|m| m.plan().is_complete());
        self.decline(&pool, idle);
        Ok(())
    }

    fn decline(&self, offers: &[Offer], idle: bool) {
        let filters = if idle {
            self.config.long_decline()
        } else {
            self.config.short_decline()
        };
        for offer in offers {
            debug!(offer = %offer.id, refuse_seconds = filters.refuse_seconds, "declining offer");
            if let Err(e) = self.driver.decline_offer(&offer.id, &filters) {
                warn!(offer = %offer.id, error = %e, "failed to decline offer");
            }
        }
    }

    fn step_mut(&mut self, key: StepKey) -> SchedulerResult<&mut Step> {
        self.coordinator
            .step_mut(key)
            .ok_or_else(|| SchedulerError::Internal(format!("candidate step {key:?} not found")))
    }

    fn launch_action(&self, step: &Step, recovery: RecoveryType, tasks: &StoredTasks) -> LaunchAction {
        let mut ids = BTreeMap::new();
        let mut live = BTreeMap::new();
        let mut current = true;
        for target in step.tasks() {
            let Some(info) = tasks.info(&target.name) else {
                current = false;
                continue;
            };
            ids.insert(target.name.clone(), info.task_id.clone());
            let matches_target =
                info.target_config == self.target_id && recovery != RecoveryType::Permanent;
            if tasks.is_alive(&target.name) {
                live.insert(target.name.clone(), info.task_id.clone());
                current &= matches_target;
            } else if !(matches_target && task_at_goal(target, self.target_id, tasks)) {
                current = false;
            }
        }

        if current {
            if step
                .tasks()
                .iter()
                .all(|t| task_at_goal(t, self.target_id, tasks))
            {
                LaunchAction::Satisfied
            } else {
                LaunchAction::Adopt(ids)
            }
        } else if live.is_empty() {
            LaunchAction::Launch
        } else {
            let unkilled: BTreeMap<String, String> = live
                .into_iter()
                .filter(|(_, id)| !self.killer.is_pending(id))
                .collect();
            if unkilled.is_empty() {
                LaunchAction::AwaitKill
            } else {
                LaunchAction::Kill(unkilled)
            }
        }
    }

    fn process_launch(
        &mut self,
        key: StepKey,
        recovery: RecoveryType,
        tasks: &StoredTasks,
        pool: &mut Vec<Offer>,
    ) -> SchedulerResult<()> {
        let step = self
            .coordinator
            .step(key)
            .ok_or_else(|| SchedulerError::Internal(format!("candidate step {key:?} not found")))?;
        let step_name = step.name().to_string();
        let instance = step.instance().clone();

        match self.launch_action(step, recovery, tasks) {
            LaunchAction::Satisfied => {
                debug!(step = %step_name, "tasks already at goal");
                self.step_mut(key)?.force_complete();
                return Ok(());
            }
            LaunchAction::Adopt(ids) => {
                debug!(step = %step_name, tasks = ids.len(), "tracking tasks already launched");
                let step = self.step_mut(key)?;
                step.launched(&ids);
                for name in ids.keys() {
                    if let Some(status) = tasks.status(name) {
                        step.update_status(name, status);
                    }
                }
                return Ok(());
            }
            LaunchAction::Kill(live) => {
                info!(step = %step_name, tasks = live.len(), "killing outdated tasks before relaunch");
                for task_id in live.values() {
                    self.killer.kill(self.driver.as_ref(), task_id);
                }
                self.step_mut(key)?.kill_issued(&live);
                return Ok(());
            }
            LaunchAction::AwaitKill => {
                debug!(step = %step_name, "waiting for kills to be confirmed");
                return Ok(());
            }
            LaunchAction::Launch => {}
        }

        let Some(pod) = self.target.pod(&instance.pod_type).cloned() else {
            warn!(step = %step_name, pod = %instance.pod_type, "pod missing from target config");
            return Ok(());
        };
        let existing: Vec<TaskInfo> = pod
            .tasks
            .iter()
            .filter_map(|t| tasks.info(&instance.task_name(&t.name)).cloned())
            .collect();
        let requirement = PodInstanceRequirement::new(pod, instance.index, self.target_id)
            .with_existing(existing)
            .with_recovery(recovery);

        let evaluation = self.evaluator.evaluate(&requirement, pool);
        let Some(recommendation) = evaluation.recommendation else {
            debug!(step = %step_name, misses = evaluation.misses.len(), "no offer satisfies step");
            self.step_mut(key)?.offer_missed();
            return Ok(());
        };

        self.state.store_tasks(&recommendation.tasks)?;
        for task in &recommendation.tasks {
            let mut staging = TaskStatus::new(&task.task_id, TaskState::Staging);
            staging.agent_id = Some(recommendation.agent_id.clone());
            self.state.store_status(&task.name, &staging)?;
            if recovery == RecoveryType::Permanent {
                self.state
                    .clear_property(&task.name, PERMANENTLY_FAILED_PROPERTY)?;
            }
        }

        info!(
            step = %step_name,
            offer = %recommendation.offer_id,
            operations = recommendation.operations.len(),
            "accepting offer"
        );
        if let Err(e) = self.driver.accept_offers(
            std::slice::from_ref(&recommendation.offer_id),
            &recommendation.operations,
            &self.config.short_decline(),
        ) {
            warn!(offer = %recommendation.offer_id, error = %e, "failed to accept offer");
        }

        let ids: BTreeMap<String, String> = recommendation
            .tasks
            .iter()
            .map(|t| (t.name.clone(), t.task_id.clone()))
            .collect();
        self.step_mut(key)?.launched(&ids);
        pool.retain(|o| o.id != recommendation.offer_id);
        Ok(())
    }

    fn process_decommission(&mut self, key: StepKey, tasks: &StoredTasks) -> SchedulerResult<()> {
        let step = self
            .coordinator
            .step(key)
            .ok_or_else(|| SchedulerError::Internal(format!("candidate step {key:?} not found")))?;
        let live: BTreeMap<String, String> = step
            .task_names()
            .filter(|name| tasks.is_alive(name))
            .filter_map(|name| tasks.info(name).map(|i| (name.to_string(), i.task_id.clone())))
            .collect();
        for task_id in live.values() {
            if !self.killer.is_pending(task_id) {
                self.killer.kill(self.driver.as_ref(), task_id);
            }
        }
        self.step_mut(key)?.kill_issued(&live);
        Ok(())
    }

    fn process_cleanup(&mut self, key: StepKey) -> SchedulerResult<()> {
        let names: Vec<String> = self.step_mut(key)?.task_names().map(str::to_string).collect();
        for name in &names {
            self.state.delete_task(name)?;
        }
        self.step_mut(key)?.force_complete();
        Ok(())
    }

    fn clean_reservations(&mut self, pool: &mut Vec<Offer>) -> SchedulerResult<()> {
        let stored = self.state.fetch_tasks()?;
        let cleaner = ResourceCleaner::new(&self.target.role, &stored);
        let mut consumed = BTreeSet::new();
        for offer in pool.iter() {
            let operations = cleaner.operations(offer);
            if operations.is_empty() {
                continue;
            }
            if let Err(e) = self.driver.accept_offers(
                std::slice::from_ref(&offer.id),
                &operations,
                &self.config.short_decline(),
            ) {
                warn!(offer = %offer.id, error = %e, "failed to release orphaned reservations");
            }
            consumed.insert(offer.id.clone());
        }
        pool.retain(|o| !consumed.contains(&o.id));
        Ok(())
    }

    // ── Task status ────────────────────────────────────────────────

    /// Record a task status and route it to the plans.
    pub fn status(&mut self, status: TaskStatus) -> SchedulerResult<()> {
        let task_name = match task_name_from_id(&status.task_id) {
            Ok(name) => name.to_string(),
            Err(e) => {
                warn!(task_id = %status.task_id, error = %e, "status for malformed task id");
                self.acknowledge(&status);
                return Ok(());
            }
        };
        let known = self
            .state
            .fetch_task(&task_name)?
            .is_some_and(|info| info.task_id == status.task_id);
        if !known {
            warn!(task_id = %status.task_id, state = %status.state, "status for unknown task");
            self.acknowledge(&status);
            return Ok(());
        }

        let merged = self.state.store_status(&task_name, &status)?;
        debug!(task = %task_name, state = %merged.state, "task status received");
        self.reconciler.update(&merged);
        self.killer.on_status(&merged);
        self.coordinator.update_status(&task_name, &merged);
        self.refresh_recovery()?;
        self.acknowledge(&status);
        Ok(())
    }

    fn acknowledge(&self, status: &TaskStatus) {
        if let Err(e) = self.driver.acknowledge(status) {
            warn!(task_id = %status.task_id, error = %e, "failed to acknowledge status");
        }
    }

    // ── Config and operator requests ───────────────────────────────

    /// Offer `candidate` as the new target config.
    ///
    /// A rejected candidate keeps the current target; the errors are attached
    /// to the deploy plan.
    pub fn update_config(&mut self, candidate: &ServiceSpec) -> SchedulerResult<()> {
        let update = self.configs.update(candidate)?;
        self.apply_update(update)
    }

    fn apply_update(&mut self, update: ConfigUpdate) -> SchedulerResult<()> {
        if update.errors.is_empty() {
            self.target_id = update.target_id;
            self.target = update.target;
            self.evaluator = OfferEvaluator::new(ServiceContext::from_spec(&self.target));
        } else {
            warn!(
                errors = update.errors.len(),
                config = %self.target_id,
                "config rejected, keeping target"
            );
        }

        let tasks = StoredTasks::load(&self.state)?;
        let deploy = deploy_plan(self.target_id, &self.target, &tasks, &update.errors);
        self.install(PlanKind::Deploy, deploy);

        let decommission = decommission_plan(&self.target, &tasks, self.decommission_plan());
        self.install(PlanKind::Decommission, decommission);

        self.refresh_recovery_with(&tasks);
        Ok(())
    }

    /// Mark every task of `instance` (e.g. `POD-A-0`) for replacement on
    /// fresh reservations and kill the ones still running.
    pub fn replace_pod(&mut self, instance: &str) -> SchedulerResult<()> {
        let tasks = StoredTasks::load(&self.state)?;
        let infos: Vec<TaskInfo> = tasks
            .infos()
            .filter(|t| t.pod_instance().to_string() == instance)
            .cloned()
            .collect();
        if infos.is_empty() {
            return Err(SchedulerError::PodNotFound(instance.to_string()));
        }

        for info in &infos {
            self.state
                .store_property(&info.name, PERMANENTLY_FAILED_PROPERTY, b"true")?;
            if tasks.is_alive(&info.name) && !self.killer.is_pending(&info.task_id) {
                self.killer.kill(self.driver.as_ref(), &info.task_id);
            }
        }
        info!(%instance, tasks = infos.len(), "pod instance marked for replacement");
        self.refresh_recovery()
    }

    /// Re-issue kills that have not been confirmed.
    pub fn kill_timer_tick(&mut self) {
        self.killer.tick(self.driver.as_ref());
    }

    // ── Recovery ───────────────────────────────────────────────────

    fn refresh_recovery(&mut self) -> SchedulerResult<()> {
        let tasks = StoredTasks::load(&self.state)?;
        self.refresh_recovery_with(&tasks);
        Ok(())
    }

    fn refresh_recovery_with(&mut self, tasks: &StoredTasks) {
        let dirty = self.coordinator.dirty_assets_excluding(PlanKind::Recovery);
        let pending_kills: BTreeSet<String> = self.killer.pending().map(str::to_string).collect();
        let inputs = RecoveryInputs {
            target: &self.target,
            tasks,
            dirty: &dirty,
            pending_kills: &pending_kills,
            strategy: self.config.recovery_strategy,
        };
        let plan = recovery_plan(&inputs, self.recovery_plan());
        self.install(PlanKind::Recovery, plan);
    }
}
