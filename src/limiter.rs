use crate::error::ExecError;
use crate::protocol::ScopeLabel;

use std::collections::HashMap;

use tracing::{error, trace};

/// Limits on concurrently active executions. A limit of `0` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConcurrencyConfig {
  /// Maximum number of active executions across all scopes.
  pub max_executions: usize,
  /// Maximum number of active executions per scope label.
  pub scope_limits: HashMap<ScopeLabel, usize>,
}

impl ConcurrencyConfig {
  pub fn unlimited() -> Self {
    Self::default()
  }

  pub fn with_max_executions(mut self, max_executions: usize) -> Self {
    self.max_executions = max_executions;
    self
  }

  pub fn with_scope_limit(mut self, scope: impl Into<ScopeLabel>, limit: usize) -> Self {
    self.scope_limits.insert(scope.into(), limit);
    self
  }

  fn scope_limit(&self, scope: &str) -> usize {
    self.scope_limits.get(scope).copied().unwrap_or(0)
  }
}

/// Counts active executions globally and per scope.
///
/// Not synchronized on its own: the manager only touches it while holding its
/// registry lock.
#[derive(Debug)]
pub(crate) struct ConcurrencyLimiter {
  config: ConcurrencyConfig,
  active: usize,
  active_by_scope: HashMap<ScopeLabel, usize>,
}

impl ConcurrencyLimiter {
  pub(crate) fn new(config: ConcurrencyConfig) -> Self {
    Self {
      config,
      active: 0,
      active_by_scope: HashMap::new(),
    }
  }

  pub(crate) fn active(&self) -> usize {
    self.active
  }

  pub(crate) fn acquire(&mut self, scope: Option<&str>) -> Result<(), ExecError> {
    let global_limit = self.config.max_executions;
    if global_limit > 0 && self.active >= global_limit {
      return Err(ExecError::QuotaExceeded(format!(
        "{} of {} executions active",
        self.active, global_limit
      )));
    }

    if let Some(scope) = scope {
      let scope_limit = self.config.scope_limit(scope);
      let scope_active = self.active_by_scope.get(scope).copied().unwrap_or(0);
      if scope_limit > 0 && scope_active >= scope_limit {
        return Err(ExecError::QuotaExceeded(format!(
          "{} of {} executions active in scope '{}'",
          scope_active, scope_limit, scope
        )));
      }
      *self.active_by_scope.entry(scope.to_string()).or_insert(0) += 1;
    }

    self.active += 1;
    trace!(active = self.active, ?scope, "Limiter: Execution slot acquired.");
    Ok(())
  }

  pub(crate) fn release(&mut self, scope: Option<&str>) {
    match self.active.checked_sub(1) {
      Some(active) => self.active = active,
      None => error!("Limiter: Release without matching acquire, global count already zero."),
    }

    if let Some(scope) = scope {
      match self.active_by_scope.get_mut(scope) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
          self.active_by_scope.remove(scope);
        }
        None => error!(%scope, "Limiter: Release without matching acquire, scope count already zero."),
      }
    }
    trace!(active = self.active, ?scope, "Limiter: Execution slot released.");
  }
}
