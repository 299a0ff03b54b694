//! Offer evaluator — matches a pod instance requirement against offers.
//!
//! For each offer the evaluator subtracts the requirement from a
//! [`ResourcePool`] and, when everything fits, produces the ordered
//! operation batch that realizes the launch:
//!
//! ```text
//! UNRESERVE*  (shrunk reservations)
//! RESERVE*    (task resources, new or grown)
//! CREATE*     (new persistent volumes)
//! RESERVE*    (executor resources)
//! LAUNCH_GROUP
//! ```
//!
//! When several offers fit, the one holding the instance's own reservations
//! wins, then the one left with the least unreserved capacity, then the
//! earliest offered.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use stagehand_core::ids;
use stagehand_core::{
    CPUS, CommandInfo, DISK, DiskInfo, ExecutorInfo, GPUS, MEM, Offer, Operation, PORTS, Range,
    Reservation, Resource, ServiceSpec, TaskInfo, TaskSpec, VolumeSpec,
};
use tracing::{debug, info};

use crate::requirement::PodInstanceRequirement;
use crate::resources::{EPSILON, ResourcePool, Shortfall, ranges_of};

/// Service-wide identity used when reserving resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContext {
    pub name: String,
    pub role: String,
    pub principal: String,
    pub user: Option<String>,
}

impl ServiceContext {
    pub fn from_spec(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            role: spec.role.clone(),
            principal: spec.principal.clone(),
            user: spec.user.clone(),
        }
    }
}

/// A successful match of a requirement against one offer.
#[derive(Debug, Clone)]
pub struct OfferRecommendation {
    pub offer_id: String,
    pub agent_id: String,
    pub operations: Vec<Operation>,
    /// Tasks launched by the batch, as they should be stored.
    pub tasks: Vec<TaskInfo>,
    /// Offer resources taken by the batch, reserved and unreserved.
    pub consumed: Vec<Resource>,
    pub owns_reservations: bool,
    /// Unreserved scalar capacity the offer has left after the batch.
    pub remainder: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfferMiss {
    pub offer_id: String,
    pub reason: Shortfall,
}

#[derive(Debug, Default)]
pub struct Evaluation {
    pub recommendation: Option<OfferRecommendation>,
    pub misses: Vec<OfferMiss>,
}

/// Environment variable a named port's value is exported as.
pub fn port_env_name(port: &str) -> String {
    format!("PORT_{}", port.to_uppercase().replace('-', "_"))
}

#[derive(Clone, Copy)]
enum Section {
    Task,
    Executor,
}

/// Working state while one requirement is matched against one offer.
struct Matcher<'a> {
    context: &'a ServiceContext,
    resource_set: String,
    pool: ResourcePool,
    unreserves: Vec<Operation>,
    task_reserves: Vec<Operation>,
    creates: Vec<Operation>,
    executor_reserves: Vec<Operation>,
    consumed: Vec<Resource>,
    owns_reservations: bool,
}

impl<'a> Matcher<'a> {
    fn new(context: &'a ServiceContext, resource_set: String, pool: ResourcePool) -> Self {
        Self {
            context,
            resource_set,
            pool,
            unreserves: Vec::new(),
            task_reserves: Vec::new(),
            creates: Vec::new(),
            executor_reserves: Vec::new(),
            consumed: Vec::new(),
            owns_reservations: false,
        }
    }

    fn reservation(&self, resource_id: String) -> Reservation {
        Reservation {
            role: self.context.role.clone(),
            principal: self.context.principal.clone(),
            resource_id,
            resource_set: Some(self.resource_set.clone()),
        }
    }

    fn reserves_mut(&mut self, section: Section) -> &mut Vec<Operation> {
        match section {
            Section::Task => &mut self.task_reserves,
            Section::Executor => &mut self.executor_reserves,
        }
    }

    /// Claim a scalar, reusing and resizing an existing reservation when there is one.
    fn claim_scalar(
        &mut self,
        name: &str,
        amount: f64,
        existing: Option<&Resource>,
        section: Section,
    ) -> Result<Resource, Shortfall> {
        let Some(resource_id) = existing.and_then(Resource::resource_id) else {
            let unreserved = self.pool.consume_scalar(name, amount)?;
            self.consumed.push(unreserved);
            let reserved = Resource::scalar(name, amount)
                .with_reservation(self.reservation(ids::new_resource_id()));
            self.reserves_mut(section).push(Operation::Reserve {
                resource: reserved.clone(),
            });
            return Ok(reserved);
        };

        let held = self.pool.consume_reserved(resource_id)?;
        let held_amount = held.as_scalar().unwrap_or(0.0);
        let reservation = self.reservation(resource_id.to_string());
        self.consumed.push(held);
        self.owns_reservations = true;

        if amount > held_amount + EPSILON {
            let delta = amount - held_amount;
            let grown = self.pool.consume_scalar(name, delta)?;
            self.consumed.push(grown);
            self.reserves_mut(section).push(Operation::Reserve {
                resource: Resource::scalar(name, delta).with_reservation(reservation.clone()),
            });
        } else if held_amount > amount + EPSILON {
            self.unreserves.push(Operation::Unreserve {
                resource: Resource::scalar(name, held_amount - amount)
                    .with_reservation(reservation.clone()),
            });
        }
        Ok(Resource::scalar(name, amount).with_reservation(reservation))
    }

    fn claim_ports(
        &mut self,
        task: &TaskSpec,
        existing: Option<&TaskInfo>,
        env: &mut BTreeMap<String, String>,
    ) -> Result<Option<Resource>, Shortfall> {
        let ports = &task.resources.ports;
        if ports.is_empty() {
            return Ok(None);
        }

        let held_id = existing
            .and_then(|t| t.resources.iter().find(|r| r.name == PORTS))
            .and_then(Resource::resource_id);
        let mut released: Vec<Range> = Vec::new();
        if let (Some(resource_id), Some(prior)) = (held_id, existing) {
            let held = self.pool.consume_reserved(resource_id)?;
            self.owns_reservations = true;
            self.consumed.push(held.clone());
            let held_ranges = held.as_ranges().unwrap_or_default().to_vec();
            let reused: Option<Vec<(String, u64)>> = ports
                .iter()
                .map(|p| {
                    let key = port_env_name(&p.name);
                    prior
                        .command
                        .environment
                        .get(&key)
                        .and_then(|v| v.parse::<u64>().ok())
                        .filter(|v| p.port == 0 || p.port == *v)
                        .filter(|v| held_ranges.iter().any(|r| r.contains(*v)))
                        .map(|v| (key, v))
                })
                .collect();
            if let Some(assigned) = reused {
                env.extend(assigned.into_iter().map(|(k, v)| (k, v.to_string())));
                return Ok(Some(held));
            }
            // The port layout changed: the old ports go back to the pool and
            // are claimed again alongside any new ones.
            self.pool.release(&held);
            released = held_ranges;
            self.unreserves.push(Operation::Unreserve { resource: held });
        }

        let mut values = Vec::with_capacity(ports.len());
        for port in ports.iter().filter(|p| p.port != 0) {
            let value = self.pool.consume_value(PORTS, port.port)?;
            env.insert(port_env_name(&port.name), value.to_string());
            values.push(value);
        }
        for port in ports.iter().filter(|p| p.port == 0) {
            let value = self.pool.consume_any_value(PORTS)?;
            env.insert(port_env_name(&port.name), value.to_string());
            values.push(value);
        }
        let fresh: Vec<u64> = values
            .iter()
            .copied()
            .filter(|v| !released.iter().any(|r| r.contains(*v)))
            .collect();
        if !fresh.is_empty() {
            self.consumed.push(Resource::ranges(PORTS, ranges_of(&fresh)));
        }
        let ranges = ranges_of(&values);
        let reserved =
            Resource::ranges(PORTS, ranges).with_reservation(self.reservation(ids::new_resource_id()));
        self.task_reserves.push(Operation::Reserve {
            resource: reserved.clone(),
        });
        Ok(Some(reserved))
    }

    fn claim_volume(
        &mut self,
        volume: &VolumeSpec,
        existing: Option<&TaskInfo>,
    ) -> Result<Resource, Shortfall> {
        let held = existing.and_then(|t| {
            t.resources.iter().find(|r| {
                r.disk
                    .as_ref()
                    .is_some_and(|d| d.container_path == volume.container_path)
            })
        });
        if let Some(held) = held {
            let claimed = held
                .resource_id()
                .and_then(|id| self.pool.consume_reserved(id).ok())
                .ok_or_else(|| Shortfall::MissingVolume(volume.container_path.clone()))?;
            self.owns_reservations = true;
            self.consumed.push(claimed.clone());
            return Ok(claimed);
        }

        let unreserved = self.pool.consume_scalar(DISK, volume.size)?;
        self.consumed.push(unreserved);
        let reserved = Resource::scalar(DISK, volume.size)
            .with_reservation(self.reservation(ids::new_resource_id()));
        self.task_reserves.push(Operation::Reserve {
            resource: reserved.clone(),
        });
        let created = reserved.with_disk(DiskInfo {
            persistence_id: ids::new_persistence_id(),
            container_path: volume.container_path.clone(),
        });
        self.creates.push(Operation::Create {
            volume: created.clone(),
        });
        Ok(created)
    }
}

fn existing_scalar<'r>(resources: &'r [Resource], name: &str) -> Option<&'r Resource> {
    resources
        .iter()
        .find(|r| r.name == name && r.is_reserved() && !r.is_volume())
}

/// Evaluates requirements against offers for one service.
#[derive(Debug, Clone)]
pub struct OfferEvaluator {
    context: ServiceContext,
}

impl OfferEvaluator {
    pub fn new(context: ServiceContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    /// Evaluate `requirement` against every offer and pick the best match.
    pub fn evaluate(&self, requirement: &PodInstanceRequirement, offers: &[Offer]) -> Evaluation {
        let mut matches = Vec::new();
        let mut misses = Vec::new();
        for (arrival, offer) in offers.iter().enumerate() {
            match self.evaluate_offer(requirement, offer) {
                Ok(recommendation) => matches.push((arrival, recommendation)),
                Err(reason) => {
                    debug!(
                        offer = %offer.id,
                        instance = %requirement.instance(),
                        %reason,
                        "offer does not satisfy requirement"
                    );
                    misses.push(OfferMiss {
                        offer_id: offer.id.clone(),
                        reason,
                    });
                }
            }
        }

        matches.sort_by(|(arrival_a, a), (arrival_b, b)| {
            b.owns_reservations
                .cmp(&a.owns_reservations)
                .then(a.remainder.partial_cmp(&b.remainder).unwrap_or(Ordering::Equal))
                .then(arrival_a.cmp(arrival_b))
        });

        let recommendation = matches.into_iter().next().map(|(_, r)| r);
        if let Some(rec) = &recommendation {
            info!(
                offer = %rec.offer_id,
                instance = %requirement.instance(),
                operations = rec.operations.len(),
                "offer matched requirement"
            );
        }
        Evaluation {
            recommendation,
            misses,
        }
    }

    /// Match a requirement against a single offer.
    pub fn evaluate_offer(
        &self,
        requirement: &PodInstanceRequirement,
        offer: &Offer,
    ) -> Result<OfferRecommendation, Shortfall> {
        let pod = &requirement.pod;
        let instance = requirement.instance();
        let pool = ResourcePool::from_offer(offer, &self.context.role);
        let mut matcher = Matcher::new(&self.context, pod.resource_set_id(), pool);
        let user = pod.user.clone().or_else(|| self.context.user.clone());

        let mut tasks = Vec::with_capacity(pod.tasks.len());
        for task in &pod.tasks {
            let existing = requirement.existing_task(&task.name);
            let held: &[Resource] = existing.map(|t| t.resources.as_slice()).unwrap_or_default();
            let mut resources = Vec::new();

            let scalars = [
                (CPUS, task.resources.cpus),
                (MEM, task.resources.mem),
                (DISK, task.resources.disk),
                (GPUS, task.resources.gpus),
            ];
            for (name, amount) in scalars {
                if amount <= 0.0 {
                    continue;
                }
                resources.push(matcher.claim_scalar(
                    name,
                    amount,
                    existing_scalar(held, name),
                    Section::Task,
                )?);
            }

            let mut env = task.env.clone();
            env.insert("TASK_NAME".into(), instance.task_name(&task.name));
            env.insert("POD_INSTANCE_INDEX".into(), requirement.index.to_string());
            if let Some(ports) = matcher.claim_ports(task, existing, &mut env)? {
                resources.push(ports);
            }
            for volume in &task.volumes {
                resources.push(matcher.claim_volume(volume, existing)?);
            }

            let name = instance.task_name(&task.name);
            tasks.push(TaskInfo {
                task_id: ids::new_task_id(&name),
                name,
                agent_id: offer.agent_id.clone(),
                pod_type: pod.name.clone(),
                pod_index: requirement.index,
                target_config: requirement.target_config,
                goal: task.goal,
                command: CommandInfo {
                    value: task.command.clone(),
                    environment: env,
                    user: user.clone(),
                },
                image: task.image.clone(),
                resources,
                executor: ExecutorInfo {
                    executor_id: String::new(),
                    name: String::new(),
                    resources: Vec::new(),
                },
                health_check: task.health_check.clone(),
                readiness_check: task.readiness_check.clone(),
            });
        }

        let held_executor = requirement.existing_executor_resources();
        let mut executor_resources = Vec::new();
        let executor_scalars = [
            (CPUS, pod.executor.cpus),
            (MEM, pod.executor.mem),
            (DISK, pod.executor.disk),
        ];
        for (name, amount) in executor_scalars {
            if amount <= 0.0 {
                continue;
            }
            executor_resources.push(matcher.claim_scalar(
                name,
                amount,
                existing_scalar(held_executor, name),
                Section::Executor,
            )?);
        }

        let executor = ExecutorInfo {
            executor_id: ids::new_executor_id(&instance.to_string()),
            name: instance.to_string(),
            resources: executor_resources,
        };
        for task in &mut tasks {
            task.executor = executor.clone();
        }

        let Matcher {
            pool,
            unreserves,
            task_reserves,
            creates,
            executor_reserves,
            consumed,
            owns_reservations,
            ..
        } = matcher;

        let mut operations = unreserves;
        operations.extend(task_reserves);
        operations.extend(creates);
        operations.extend(executor_reserves);
        operations.push(Operation::LaunchGroup {
            executor,
            tasks: tasks.clone(),
        });

        Ok(OfferRecommendation {
            offer_id: offer.id.clone(),
            agent_id: offer.agent_id.clone(),
            operations,
            tasks,
            consumed,
            owns_reservations,
            remainder: pool.unreserved_total(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{OperationKind, PodSpec, RecoveryType, TaskSpec};
    use uuid::Uuid;

    fn context() -> ServiceContext {
        ServiceContext::from_spec(&ServiceSpec::new("svc"))
    }

    fn pod_a() -> PodSpec {
        PodSpec::new("POD-A", 1).with_task(
            TaskSpec::new("A", "echo a", 1.0, 1000.0).with_volume("test-container-path", 1500.0),
        )
    }

    fn sufficient_for_a() -> Vec<Resource> {
        vec![
            Resource::scalar(CPUS, 1.1),
            Resource::scalar(MEM, 1032.0),
            Resource::scalar(DISK, 1756.0),
        ]
    }

    fn kinds(ops: &[Operation]) -> Vec<OperationKind> {
        ops.iter().map(Operation::kind).collect()
    }

    #[test]
    fn test_first_launch_emits_full_batch() {
        let evaluator = OfferEvaluator::new(context());
        let req = PodInstanceRequirement::new(pod_a(), 0, Uuid::new_v4());
        let offer = Offer::new("o1", "agent-1", sufficient_for_a());
        let rec = evaluator.evaluate(&req, &[offer]).recommendation.unwrap();

        use OperationKind::*;
        assert_eq!(
            kinds(&rec.operations),
            vec![Reserve, Reserve, Reserve, Create, Reserve, Reserve, Reserve, LaunchGroup]
        );
        assert!(!rec.owns_reservations);
        assert!(rec.remainder < EPSILON);

        let task = &rec.tasks[0];
        assert_eq!(task.name, "POD-A-0-A");
        assert_eq!(task.agent_id, "agent-1");
        assert_eq!(task.resources.len(), 3);
        assert_eq!(task.executor.resources.len(), 3);
        assert!(task.resources.iter().all(Resource::is_reserved));
        assert_eq!(task.persistence_ids().count(), 1);
        assert_eq!(task.command.environment["TASK_NAME"], "POD-A-0-A");
    }

    #[test]
    fn test_insufficient_offer_emits_nothing() {
        let evaluator = OfferEvaluator::new(context());
        let req = PodInstanceRequirement::new(pod_a(), 0, Uuid::new_v4());
        let offer = Offer::new(
            "o1",
            "agent-1",
            vec![Resource::scalar(CPUS, 0.5), Resource::scalar(MEM, 500.0)],
        );
        let eval = evaluator.evaluate(&req, &[offer]);
        assert!(eval.recommendation.is_none());
        assert_eq!(eval.misses.len(), 1);
        assert!(matches!(eval.misses[0].reason, Shortfall::Scalar { .. }));
    }

    fn launched(evaluator: &OfferEvaluator, req: &PodInstanceRequirement) -> TaskInfo {
        let offer = Offer::new("o1", "agent-1", sufficient_for_a());
        evaluator.evaluate(req, &[offer]).recommendation.unwrap().tasks[0].clone()
    }

    fn reserved_offer(id: &str, task: &TaskInfo, extra: Vec<Resource>) -> Offer {
        let mut resources: Vec<Resource> = task.resources.clone();
        resources.extend(task.executor.resources.clone());
        resources.extend(extra);
        Offer::new(id, &task.agent_id, resources)
    }

    #[test]
    fn test_relaunch_in_place_is_launch_only() {
        let evaluator = OfferEvaluator::new(context());
        let config = Uuid::new_v4();
        let first = launched(&evaluator, &PodInstanceRequirement::new(pod_a(), 0, config));

        let req = PodInstanceRequirement::new(pod_a(), 0, config)
            .with_existing(vec![first.clone()])
            .with_recovery(RecoveryType::Transient);
        let rec = evaluator
            .evaluate(&req, &[reserved_offer("o2", &first, vec![])])
            .recommendation
            .unwrap();
        assert_eq!(kinds(&rec.operations), vec![OperationKind::LaunchGroup]);
        assert!(rec.owns_reservations);

        let relaunched = &rec.tasks[0];
        assert_ne!(relaunched.task_id, first.task_id);
        let old: Vec<&str> = first.resource_ids().collect();
        let new: Vec<&str> = relaunched.resource_ids().collect();
        assert_eq!(old, new);
        assert_eq!(
            relaunched.persistence_ids().collect::<Vec<_>>(),
            first.persistence_ids().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_grown_reservation_reserves_delta() {
        let evaluator = OfferEvaluator::new(context());
        let first = launched(
            &evaluator,
            &PodInstanceRequirement::new(pod_a(), 0, Uuid::new_v4()),
        );

        let mut bigger = pod_a();
        bigger.tasks[0].resources.cpus = 2.0;
        let req = PodInstanceRequirement::new(bigger, 0, Uuid::new_v4()).with_existing(vec![first.clone()]);
        let offer = reserved_offer("o2", &first, vec![Resource::scalar(CPUS, 1.0)]);
        let rec = evaluator.evaluate(&req, &[offer]).recommendation.unwrap();

        assert_eq!(
            kinds(&rec.operations),
            vec![OperationKind::Reserve, OperationKind::LaunchGroup]
        );
        let Operation::Reserve { resource } = &rec.operations[0] else {
            panic!("expected reserve");
        };
        assert_eq!(resource.as_scalar(), Some(1.0));
        let cpu_id = first.resources.iter().find(|r| r.name == CPUS).unwrap().resource_id();
        assert_eq!(resource.resource_id(), cpu_id);
        let cpus = rec.tasks[0].resources.iter().find(|r| r.name == CPUS).unwrap();
        assert_eq!(cpus.as_scalar(), Some(2.0));
    }

    #[test]
    fn test_shrunk_reservation_unreserves_excess() {
        let evaluator = OfferEvaluator::new(context());
        let first = launched(
            &evaluator,
            &PodInstanceRequirement::new(pod_a(), 0, Uuid::new_v4()),
        );

        let mut smaller = pod_a();
        smaller.tasks[0].resources.mem = 600.0;
        let req = PodInstanceRequirement::new(smaller, 0, Uuid::new_v4()).with_existing(vec![first.clone()]);
        let rec = evaluator
            .evaluate(&req, &[reserved_offer("o2", &first, vec![])])
            .recommendation
            .unwrap();
        assert_eq!(
            kinds(&rec.operations),
            vec![OperationKind::Unreserve, OperationKind::LaunchGroup]
        );
        let Operation::Unreserve { resource } = &rec.operations[0] else {
            panic!("expected unreserve");
        };
        assert_eq!(resource.as_scalar(), Some(400.0));
    }

    #[test]
    fn test_permanent_recovery_ignores_old_reservations() {
        let evaluator = OfferEvaluator::new(context());
        let config = Uuid::new_v4();
        let first = launched(&evaluator, &PodInstanceRequirement::new(pod_a(), 0, config));
        let req = PodInstanceRequirement::new(pod_a(), 0, config)
            .with_existing(vec![first.clone()])
            .with_recovery(RecoveryType::Permanent);
        let rec = evaluator
            .evaluate(&req, &[reserved_offer("o2", &first, sufficient_for_a())])
            .recommendation
            .unwrap();
        assert_eq!(rec.operations.len(), 8);
        assert!(!rec.owns_reservations);
        let old: Vec<&str> = first.resource_ids().collect();
        assert!(rec.tasks[0].resource_ids().all(|id| !old.contains(&id)));
    }

    #[test]
    fn test_relaunch_requires_reservations_in_offer() {
        let evaluator = OfferEvaluator::new(context());
        let config = Uuid::new_v4();
        let first = launched(&evaluator, &PodInstanceRequirement::new(pod_a(), 0, config));
        let req = PodInstanceRequirement::new(pod_a(), 0, config).with_existing(vec![first]);
        let eval = evaluator.evaluate(&req, &[Offer::new("o2", "agent-2", sufficient_for_a())]);
        assert!(eval.recommendation.is_none());
        assert!(matches!(
            eval.misses[0].reason,
            Shortfall::MissingReservation(_)
        ));
    }

    #[test]
    fn test_ranking_prefers_own_reservations_then_smallest_remainder() {
        let evaluator = OfferEvaluator::new(context());
        let config = Uuid::new_v4();
        let first = launched(&evaluator, &PodInstanceRequirement::new(pod_a(), 0, config));

        // Without existing reservations: the tighter fit wins, ties go to arrival order.
        let fresh = PodInstanceRequirement::new(pod_a(), 0, config);
        let mut roomy = sufficient_for_a();
        roomy.push(Resource::scalar(CPUS, 4.0));
        let offers = vec![
            Offer::new("roomy", "a1", roomy),
            Offer::new("tight", "a2", sufficient_for_a()),
            Offer::new("tight-late", "a3", sufficient_for_a()),
        ];
        let rec = evaluator.evaluate(&fresh, &offers).recommendation.unwrap();
        assert_eq!(rec.offer_id, "tight");

        // With existing reservations the owning offer wins despite leftovers.
        let reuse = PodInstanceRequirement::new(pod_a(), 0, config).with_existing(vec![first.clone()]);
        let offers = vec![
            Offer::new("tight", "a2", sufficient_for_a()),
            reserved_offer("owned", &first, vec![Resource::scalar(CPUS, 8.0)]),
        ];
        let rec = evaluator.evaluate(&reuse, &offers).recommendation.unwrap();
        assert_eq!(rec.offer_id, "owned");
    }

    #[test]
    fn test_ports_fixed_and_dynamic() {
        let evaluator = OfferEvaluator::new(context());
        let pod = PodSpec::new("web", 1).with_task(
            TaskSpec::new("server", "serve", 0.5, 256.0)
                .with_port("admin", 0)
                .with_port("http", 8080),
        );
        let resources = vec![
            Resource::scalar(CPUS, 1.0),
            Resource::scalar(MEM, 512.0),
            Resource::scalar(DISK, 256.0),
            Resource::ranges(PORTS, vec![Range::new(8080, 8082)]),
        ];
        let offer = Offer::new("o1", "agent-1", resources);
        let req = PodInstanceRequirement::new(pod, 0, Uuid::new_v4());
        let rec = evaluator.evaluate(&req, std::slice::from_ref(&offer)).recommendation.unwrap();

        let task = &rec.tasks[0];
        assert_eq!(task.command.environment["PORT_HTTP"], "8080");
        assert_eq!(task.command.environment["PORT_ADMIN"], "8081");
        let ports = task.resources.iter().find(|r| r.name == PORTS).unwrap();
        assert_eq!(ports.as_ranges().unwrap(), &[Range::new(8080, 8081)]);

        // Relaunch keeps the same port values and reservation.
        let relaunch = PodInstanceRequirement::new(req.pod.clone(), 0, req.target_config)
            .with_existing(vec![task.clone()]);
        let mut again = task.resources.clone();
        again.extend(task.executor.resources.clone());
        let rec = evaluator
            .evaluate(&relaunch, &[Offer::new("o2", "agent-1", again)])
            .recommendation
            .unwrap();
        assert_eq!(kinds(&rec.operations), vec![OperationKind::LaunchGroup]);
        assert_eq!(rec.tasks[0].command.environment["PORT_ADMIN"], "8081");
    }

    #[test]
    fn test_changed_port_layout_reclaims_held_ports() {
        let evaluator = OfferEvaluator::new(context());
        let pod = PodSpec::new("web", 1)
            .with_task(TaskSpec::new("server", "serve", 0.5, 256.0).with_port("http", 8080));
        let offer = Offer::new(
            "o1",
            "agent-1",
            vec![
                Resource::scalar(CPUS, 1.0),
                Resource::scalar(MEM, 512.0),
                Resource::scalar(DISK, 256.0),
                Resource::ranges(PORTS, vec![Range::new(8080, 8080)]),
            ],
        );
        let req = PodInstanceRequirement::new(pod.clone(), 0, Uuid::new_v4());
        let first = evaluator.evaluate(&req, &[offer]).recommendation.unwrap().tasks[0].clone();
        let held_ports = first.resources.iter().find(|r| r.name == PORTS).unwrap().clone();

        // The update keeps http on 8080 and adds a dynamic admin port.
        let mut updated = pod;
        updated.tasks[0] = updated.tasks[0].clone().with_port("admin", 0);
        let relaunch = PodInstanceRequirement::new(updated, 0, Uuid::new_v4())
            .with_existing(vec![first.clone()]);
        let offer = reserved_offer(
            "o2",
            &first,
            vec![Resource::ranges(PORTS, vec![Range::new(8081, 9000)])],
        );
        let eval = evaluator.evaluate(&relaunch, &[offer]);
        assert!(eval.misses.is_empty(), "misses: {:?}", eval.misses);
        let rec = eval.recommendation.unwrap();

        use OperationKind::*;
        assert_eq!(kinds(&rec.operations), vec![Unreserve, Reserve, LaunchGroup]);
        let Operation::Unreserve { resource } = &rec.operations[0] else {
            panic!("expected unreserve");
        };
        assert_eq!(resource, &held_ports);

        let task = &rec.tasks[0];
        assert_eq!(task.command.environment["PORT_HTTP"], "8080");
        assert_eq!(task.command.environment["PORT_ADMIN"], "8081");
        let ports = task.resources.iter().find(|r| r.name == PORTS).unwrap();
        assert_eq!(ports.as_ranges().unwrap(), &[Range::new(8080, 8081)]);
        assert_ne!(ports.resource_id(), held_ports.resource_id());

        // 8080 is accounted once, through the held reservation.
        let consumed_8080 = rec
            .consumed
            .iter()
            .filter(|r| r.as_ranges().is_some_and(|rs| rs.iter().any(|x| x.contains(8080))))
            .count();
        assert_eq!(consumed_8080, 1);
    }

    #[test]
    fn test_missing_fixed_port() {
        let evaluator = OfferEvaluator::new(context());
        let pod = PodSpec::new("web", 1)
            .with_task(TaskSpec::new("server", "serve", 0.5, 256.0).with_port("http", 9000));
        let offer = Offer::new(
            "o1",
            "agent-1",
            vec![
                Resource::scalar(CPUS, 1.0),
                Resource::scalar(MEM, 512.0),
                Resource::ranges(PORTS, vec![Range::new(8080, 8082)]),
            ],
        );
        let req = PodInstanceRequirement::new(pod, 0, Uuid::new_v4());
        let eval = evaluator.evaluate(&req, &[offer]);
        assert_eq!(eval.misses[0].reason, Shortfall::Port(9000));
    }
}
