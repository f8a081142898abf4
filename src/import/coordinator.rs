//! Import coordinator.
//!
//! Entry point of the pipeline:
//!
//! 1. check the request shape against the registered runners
//! 2. validate every selected domain into change records
//! 3. let the stage topology turn change records into transactional units
//! 4. run the stage-groups one after another through the executor
//! 5. on success, queue side effects; on failure, flag the submitted blocks
//!    for refetch once and return the error

use crate::config::ImportConfig;
use crate::import::domain::DomainKey;
use crate::import::error::ImportError;
use crate::import::executor::TransactionExecutor;
use crate::import::options::check_options;
use crate::import::request::ImportRequest;
use crate::import::result::ImportResult;
use crate::import::runner::{build_change_sets, root_keys};
use crate::import::side_effects::SideEffects;
use crate::import::stage::{RegistryError, StageGraph};
use crate::import::unit::{ImportPlan, Timestamps};
use crate::import::validators::ValidatorRegistry;
use crate::store::ImportStore;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct ImportCoordinator {
    executor: TransactionExecutor,
    stages: StageGraph,
    validators: ValidatorRegistry,
    side_effects: SideEffects,
    config: ImportConfig,
    next_call_id: AtomicU64,
}

impl ImportCoordinator {
    /// Build a coordinator over the default stage topology.
    pub fn new(
        store: Arc<dyn ImportStore>,
        config: ImportConfig,
        side_effects: SideEffects,
    ) -> Result<Self, RegistryError> {
        Self::with_stages(store, config, side_effects, StageGraph::default())
    }

    pub fn with_stages(
        store: Arc<dyn ImportStore>,
        config: ImportConfig,
        side_effects: SideEffects,
        stages: StageGraph,
    ) -> Result<Self, RegistryError> {
        stages.verify()?;

        Ok(Self {
            executor: TransactionExecutor::new(store, config.max_concurrency),
            stages,
            validators: ValidatorRegistry::new(),
            side_effects,
            config,
            next_call_id: AtomicU64::new(1),
        })
    }

    /// Replace the validator registry, e.g. to add custom validators.
    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// The verified stage topology.
    pub fn stages(&self) -> &StageGraph {
        &self.stages
    }

    /// Validate, stage and commit `request`.
    pub async fn import(&self, request: &ImportRequest) -> Result<ImportResult, ImportError> {
        let plan = self.prepare(request)?;
        self.execute(plan).await
    }

    /// Validate and stage `request` without touching the store.
    pub fn prepare(&self, request: &ImportRequest) -> Result<ImportPlan, ImportError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);

        let selected = check_options(request).inspect_err(|err| {
            log::info!("import {call_id}: rejected request: {err}");
        })?;

        let change_sets = build_change_sets(&self.validators, &selected).inspect_err(|err| {
            log::info!("import {call_id}: {err}");
        })?;

        // Domains sent with no records still show up in the result.
        let domains = request
            .domains
            .keys()
            .filter_map(|name| name.parse::<DomainKey>().ok())
            .collect();
        let root_keys = root_keys(&change_sets);
        let timestamps = Timestamps::now();
        let groups = self.stages.build(change_sets, timestamps);

        let plan = ImportPlan {
            call_id,
            groups,
            domains,
            root_keys,
            timestamps,
            timeout: request
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(self.config.timeout),
            broadcast: request.broadcast,
        };

        log::debug!(
            "import {call_id}: prepared {} units in {} groups",
            plan.unit_count(),
            plan.groups.len()
        );

        Ok(plan)
    }

    /// Run a prepared plan.
    pub async fn execute(&self, plan: ImportPlan) -> Result<ImportResult, ImportError> {
        let ImportPlan {
            call_id,
            groups,
            domains,
            root_keys,
            timeout,
            broadcast,
            ..
        } = plan;

        let mut merged = ImportResult::with_domains(domains);

        for (index, group) in groups.into_iter().enumerate() {
            match self
                .executor
                .run_group(call_id, index, group.units, timeout)
                .await
            {
                Ok(result) => merged.merge(result),
                Err(err) => {
                    log::error!("import {call_id}: stage group {index} failed: {err}");
                    self.repair(call_id, &root_keys).await;
                    return Err(ImportError::from_unit_error(index, merged, err));
                }
            }
        }

        log::info!("import {call_id}: committed {:?}", merged.counts());
        self.side_effects.dispatch(call_id, &merged, broadcast);

        Ok(merged)
    }

    /// Flag the submitted blocks for refetch. Failures are logged only.
    async fn repair(&self, call_id: u64, root_keys: &[i64]) {
        if root_keys.is_empty() {
            return;
        }

        match self
            .executor
            .store()
            .mark_blocks_for_refetch(root_keys, Utc::now())
            .await
        {
            Ok(flagged) => log::warn!(
                "import {call_id}: flagged {flagged} of {} blocks for refetch",
                root_keys.len()
            ),
            Err(err) => log::error!("import {call_id}: failed to flag blocks for refetch: {err}"),
        }
    }
}
