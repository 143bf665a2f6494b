//! Run-wide resource accounting.
//!
//! One [`BudgetTracker`] is shared (behind an `Arc`) by every node of a run,
//! including nested loop, parallel and sub-workflow scopes. Counters are
//! atomics so concurrent executors can record usage without a lock; only
//! the per-minute rate window needs a mutex.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use switchyard_config::WorkflowSettings;

use crate::error::NodeExecutionError;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Resources consumed by one node attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
  pub tokens: u64,
  pub cost_usd: f64,
  pub api_calls: u64,
}

impl ResourceUsage {
  pub fn is_empty(&self) -> bool {
    self.tokens == 0 && self.cost_usd == 0.0 && self.api_calls == 0
  }
}

/// Aggregate usage of a run, persisted in checkpoints and records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetUsage {
  pub tokens: u64,
  pub cost_usd: f64,
  pub api_calls: u64,
  pub elapsed_ms: u64,
}

/// Ceilings taken from the workflow settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BudgetLimits {
  pub max_execution_time_ms: Option<u64>,
  pub max_total_tokens: Option<u64>,
  pub max_cost_usd: Option<f64>,
  pub max_api_calls: Option<u64>,
  pub rate_limit_per_minute: Option<u32>,
  pub cost_warning_threshold: f64,
}

impl BudgetLimits {
  pub fn from_settings(settings: &WorkflowSettings) -> Self {
    Self {
      max_execution_time_ms: settings.max_execution_time_ms,
      max_total_tokens: settings.max_total_tokens,
      max_cost_usd: settings.max_cost_usd,
      max_api_calls: settings.max_api_calls,
      rate_limit_per_minute: settings.rate_limit_per_minute,
      cost_warning_threshold: settings.cost_warning_threshold,
    }
  }
}

#[derive(Debug)]
pub struct BudgetTracker {
  limits: BudgetLimits,
  started: Instant,
  /// Time already spent before a resume.
  elapsed_offset_ms: u64,
  tokens: AtomicU64,
  cost_micros: AtomicU64,
  api_calls: AtomicU64,
  window: Mutex<VecDeque<Instant>>,
  warned: AtomicBool,
}

impl BudgetTracker {
  pub fn new(limits: BudgetLimits) -> Self {
    Self::restore(limits, &BudgetUsage::default())
  }

  /// Continue counting from usage recorded in a checkpoint.
  pub fn restore(limits: BudgetLimits, usage: &BudgetUsage) -> Self {
    let cost_micros = to_micros(usage.cost_usd);
    let warned = limits
      .max_cost_usd
      .is_some_and(|max| usage.cost_usd >= max * limits.cost_warning_threshold);
    Self {
      limits,
      started: Instant::now(),
      elapsed_offset_ms: usage.elapsed_ms,
      tokens: AtomicU64::new(usage.tokens),
      cost_micros: AtomicU64::new(cost_micros),
      api_calls: AtomicU64::new(usage.api_calls),
      window: Mutex::new(VecDeque::new()),
      warned: AtomicBool::new(warned),
    }
  }

  pub fn limits(&self) -> &BudgetLimits {
    &self.limits
  }

  pub fn elapsed_ms(&self) -> u64 {
    self.elapsed_offset_ms + self.started.elapsed().as_millis() as u64
  }

  /// Authorize one node attempt.
  ///
  /// Denied once any ceiling has been reached or the per-minute rate window
  /// is full. An authorized attempt occupies a slot in the rate window.
  pub fn authorize(&self) -> Result<(), NodeExecutionError> {
    let limits = &self.limits;

    if let Some(max) = limits.max_execution_time_ms {
      let elapsed = self.elapsed_ms();
      if elapsed >= max {
        return Err(NodeExecutionError::budget(format!(
          "execution time limit reached: {elapsed}ms of {max}ms"
        )));
      }
    }
    if let Some(max) = limits.max_total_tokens {
      let tokens = self.tokens.load(Ordering::SeqCst);
      if tokens >= max {
        return Err(NodeExecutionError::budget(format!(
          "token budget exhausted: {tokens} of {max}"
        )));
      }
    }
    if let Some(max) = limits.max_cost_usd {
      let cost = self.cost_usd();
      if cost >= max {
        return Err(NodeExecutionError::budget(format!(
          "cost budget exhausted: ${cost:.4} of ${max:.4}"
        )));
      }
    }
    if let Some(max) = limits.max_api_calls {
      let calls = self.api_calls.load(Ordering::SeqCst);
      if calls >= max {
        return Err(NodeExecutionError::budget(format!(
          "api call budget exhausted: {calls} of {max}"
        )));
      }
    }

    if let Some(per_minute) = limits.rate_limit_per_minute {
      let now = Instant::now();
      let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
      while window
        .front()
        .is_some_and(|at| now.duration_since(*at) >= RATE_WINDOW)
      {
        window.pop_front();
      }
      if window.len() >= per_minute as usize {
        return Err(NodeExecutionError::budget(format!(
          "rate limit of {per_minute} node starts per minute reached"
        )));
      }
      window.push_back(now);
    }

    Ok(())
  }

  /// Add the usage of a finished attempt.
  ///
  /// Returns an error when a total now exceeds its ceiling. On the first
  /// crossing of the cost warning threshold returns the current cost.
  pub fn record(&self, usage: &ResourceUsage) -> Result<Option<f64>, NodeExecutionError> {
    let tokens = self.tokens.fetch_add(usage.tokens, Ordering::SeqCst) + usage.tokens;
    let micros = to_micros(usage.cost_usd);
    let cost = from_micros(self.cost_micros.fetch_add(micros, Ordering::SeqCst) + micros);
    let calls = self.api_calls.fetch_add(usage.api_calls, Ordering::SeqCst) + usage.api_calls;

    let limits = &self.limits;
    if let Some(max) = limits.max_total_tokens.filter(|max| tokens > *max) {
      return Err(NodeExecutionError::budget(format!(
        "token budget exceeded: {tokens} of {max}"
      )));
    }
    if let Some(max) = limits.max_cost_usd.filter(|max| cost > *max) {
      return Err(NodeExecutionError::budget(format!(
        "cost budget exceeded: ${cost:.4} of ${max:.4}"
      )));
    }
    if let Some(max) = limits.max_api_calls.filter(|max| calls > *max) {
      return Err(NodeExecutionError::budget(format!(
        "api call budget exceeded: {calls} of {max}"
      )));
    }

    if let Some(max) = limits.max_cost_usd {
      if cost >= max * limits.cost_warning_threshold && !self.warned.swap(true, Ordering::SeqCst) {
        return Ok(Some(cost));
      }
    }
    Ok(None)
  }

  pub fn cost_usd(&self) -> f64 {
    from_micros(self.cost_micros.load(Ordering::SeqCst))
  }

  pub fn usage(&self) -> BudgetUsage {
    BudgetUsage {
      tokens: self.tokens.load(Ordering::SeqCst),
      cost_usd: self.cost_usd(),
      api_calls: self.api_calls.load(Ordering::SeqCst),
      elapsed_ms: self.elapsed_ms(),
    }
  }
}

fn to_micros(cost_usd: f64) -> u64 {
  (cost_usd.max(0.0) * 1_000_000.0).round() as u64
}

fn from_micros(micros: u64) -> f64 {
  micros as f64 / 1_000_000.0
}
