use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{RegisterError, UnknownJobError};
use crate::job::{JobDefinition, JobKind};

/// Name → definition map. Populated before the engine is built, read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct JobRegistry {
  definitions: HashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Validates and stores a definition under `name`.
  ///
  /// # Errors
  ///
  /// - [`RegisterError::DuplicateName`] if `name` is taken.
  /// - [`RegisterError::InvalidDefinition`] for a recurrent job without a
  ///   recurrence rule, an unparseable or zero recurrence, or zero
  ///   concurrency / lock limit.
  pub fn register(&mut self, name: &str, mut definition: JobDefinition) -> Result<(), RegisterError> {
    if self.definitions.contains_key(name) {
      return Err(RegisterError::DuplicateName(name.to_string()));
    }
    validate(name, &definition)?;

    definition.name = name.to_string();
    info!(
      job_name = %name,
      kind = ?definition.kind,
      concurrency = definition.concurrency,
      lock_limit = ?definition.lock_limit,
      "Registered job definition."
    );
    self.definitions.insert(name.to_string(), Arc::new(definition));
    Ok(())
  }

  /// # Errors
  /// [`UnknownJobError`] if nothing is registered under `name`.
  pub fn lookup(&self, name: &str) -> Result<Arc<JobDefinition>, UnknownJobError> {
    self
      .definitions
      .get(name)
      .cloned()
      .ok_or_else(|| UnknownJobError(name.to_string()))
  }

  pub fn contains(&self, name: &str) -> bool {
    self.definitions.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.definitions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.definitions.is_empty()
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.definitions.keys().map(String::as_str)
  }

  /// Definitions of kind [`JobKind::Recurrent`].
  pub fn recurrent(&self) -> impl Iterator<Item = &Arc<JobDefinition>> {
    self
      .definitions
      .values()
      .filter(|definition| definition.kind == JobKind::Recurrent)
  }
}

fn validate(name: &str, definition: &JobDefinition) -> Result<(), RegisterError> {
  let invalid = |reason: String| RegisterError::InvalidDefinition {
    name: name.to_string(),
    reason,
  };

  if name.trim().is_empty() {
    return Err(invalid("job name must not be empty".to_string()));
  }
  if definition.concurrency == 0 {
    return Err(invalid("concurrency must be at least 1".to_string()));
  }
  if definition.lock_limit == Some(0) {
    return Err(invalid("lock_limit must be at least 1 when set".to_string()));
  }
  if definition.lock_lifetime.is_zero() {
    return Err(invalid("lock_lifetime must be greater than zero".to_string()));
  }
  if let Some(every) = &definition.run_every {
    every.validate().map_err(invalid)?;
  }
  if definition.kind == JobKind::Recurrent
    && definition.run_every.is_none()
    && definition.get_next_run.is_none()
  {
    return Err(invalid(
      "recurrent jobs need run_every or get_next_run".to_string(),
    ));
  }
  debug!(job_name = %name, "Definition passed validation.");
  Ok(())
}
