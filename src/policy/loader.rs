//! Building evaluators from the configured policy directories and publishing
//! them. Loads are serialized by a mutex held across construction (two
//! concurrent reloads must not race to build) and the winner is published
//! with a single atomic swap, so requests in flight keep the evaluator they
//! captured.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;

use crate::metrics::telemetry;
use crate::policy::errors::PolicyError;
use crate::policy::evaluator::Evaluator;
use crate::policy::rules::{parse_policy_document, PolicyModule};
use crate::settings;

static EVALUATOR: ArcSwapOption<Evaluator> = ArcSwapOption::const_empty();
static LOAD_MUTEX: Mutex<()> = Mutex::const_new(());

/// The active evaluator. `None` only before the first successful load.
pub fn active() -> Option<Arc<Evaluator>> {
    EVALUATOR.load().as_ref().cloned()
}

/// Pointer-equality staleness test used by storage write-back.
pub(crate) fn is_active(evaluator: &Arc<Evaluator>) -> bool {
    EVALUATOR
        .load()
        .as_ref()
        .is_some_and(|active| Arc::ptr_eq(active, evaluator))
}

#[cfg(test)]
pub(crate) fn publish_for_tests(evaluator: Arc<Evaluator>) {
    EVALUATOR.store(Some(evaluator));
}

/// Read and parse every `.kdl` file under the given directories, in
/// directory order and sorted within each directory.
pub fn load_policy_modules(directories: &[String]) -> Result<Vec<PolicyModule>, PolicyError> {
    let mut modules = Vec::new();

    for directory in directories {
        let entries =
            std::fs::read_dir(directory).map_err(|source| PolicyError::PolicyDirectory {
                path: directory.clone(),
                source,
            })?;
        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "kdl").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let display = path.display().to_string();
            let contents =
                std::fs::read_to_string(&path).map_err(|source| PolicyError::PolicyRead {
                    path: display.clone(),
                    source,
                })?;
            modules.extend(parse_policy_document(&contents, &display)?);
        }
    }

    Ok(modules)
}

/// Build a fresh evaluator from the configured directories and publish it.
/// On failure the active evaluator is left untouched; nothing partially
/// constructed is ever visible to requests.
pub async fn load_policies() -> Result<(), PolicyError> {
    let load_started = Instant::now();
    let settings = settings::active();

    let _guard = LOAD_MUTEX.lock().await;
    telemetry()
        .policy_mutex_wait_seconds
        .observe(load_started.elapsed().as_secs_f64());

    let result = build(&settings);
    telemetry()
        .policy_load_seconds
        .observe(load_started.elapsed().as_secs_f64());

    let evaluator = result?;
    let names = evaluator.policy_names().to_vec();
    EVALUATOR.store(Some(Arc::new(evaluator)));
    telemetry().policy_loads.inc();

    tracing::info!(policies = ?names, directories = ?settings.policy.directories, "Policies loaded");
    Ok(())
}

fn build(settings: &settings::Settings) -> Result<Evaluator, PolicyError> {
    let modules = load_policy_modules(&settings.policy.directories)?;
    let files: Vec<&str> = modules.iter().map(|m| m.source_file.as_str()).collect();
    tracing::debug!(?files, "Building evaluator");
    Evaluator::new(modules, settings)
}
