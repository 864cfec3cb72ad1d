//! Budget ceilings and the per-session spend accumulator
//!
//! [`BudgetLimits`] is fixed when a session starts. [`BudgetTracker`] belongs
//! to exactly one session run and is never shared, so it needs no locking.

use crate::pipeline::{Stage, TokenCounts};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Ceilings applied to every session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Wall-clock ceiling for one session run
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    /// Monetary ceiling for one session
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,
    /// Token ceiling for a single agent call
    #[serde(default = "default_max_tokens_per_agent")]
    pub max_tokens_per_agent: u32,
    /// Process-wide limit on sessions running at once
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
}

fn default_max_execution_time_ms() -> u64 {
    10 * 60 * 1000
}

fn default_max_cost() -> f64 {
    2.0
}

fn default_max_tokens_per_agent() -> u32 {
    4096
}

fn default_max_concurrent_workflows() -> usize {
    8
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_execution_time_ms: default_max_execution_time_ms(),
            max_cost: default_max_cost(),
            max_tokens_per_agent: default_max_tokens_per_agent(),
            max_concurrent_workflows: default_max_concurrent_workflows(),
        }
    }
}

impl BudgetLimits {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }
}

/// A breached ceiling. Breaches are fatal and never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetBreach {
    #[error("Cost budget exceeded: spent {spent:.4}, limit {limit:.4}")]
    Cost { spent: f64, limit: f64 },

    #[error("Execution time budget exceeded: {elapsed_ms}ms elapsed, limit {limit_ms}ms")]
    Time { elapsed_ms: u64, limit_ms: u64 },

    #[error("Stage {stage} used {used} tokens, limit {limit} per agent")]
    Tokens { stage: Stage, used: u32, limit: u32 },
}

/// Spend recorded for one accepted stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSpend {
    pub stage: Stage,
    pub cost: f64,
    pub tokens: TokenCounts,
}

/// Running totals for one session run
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    limits: BudgetLimits,
    started: Instant,
    total_cost: f64,
    total_tokens: TokenCounts,
    stages: Vec<StageSpend>,
}

impl BudgetTracker {
    /// Start tracking now
    pub fn start(limits: BudgetLimits) -> Self {
        Self::started_at(limits, Instant::now())
    }

    pub fn started_at(limits: BudgetLimits, started: Instant) -> Self {
        Self {
            limits,
            started,
            total_cost: 0.0,
            total_tokens: TokenCounts::default(),
            stages: Vec::new(),
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn total_tokens(&self) -> TokenCounts {
        self.total_tokens
    }

    pub fn stages(&self) -> &[StageSpend] {
        &self.stages
    }

    /// Time left before the execution ceiling, zero once it has passed
    pub fn remaining_time(&self) -> Duration {
        self.limits
            .max_execution_time()
            .saturating_sub(self.elapsed())
    }

    /// Add spend from a stage attempt
    pub fn record(&mut self, stage: Stage, cost: f64, tokens: TokenCounts) {
        self.total_cost += cost;
        self.total_tokens.add(tokens);
        self.stages.push(StageSpend {
            stage,
            cost,
            tokens,
        });
    }

    /// Total plus the average cost of the stages seen so far; an estimate of
    /// where the next stage will leave the session.
    pub fn projected_cost(&self) -> f64 {
        if self.stages.is_empty() {
            return self.total_cost;
        }
        self.total_cost + self.total_cost / self.stages.len() as f64
    }

    /// Check the actual spend against the cost ceiling
    pub fn check_cost(&self) -> Result<(), BudgetBreach> {
        if self.total_cost > self.limits.max_cost {
            return Err(BudgetBreach::Cost {
                spent: self.total_cost,
                limit: self.limits.max_cost,
            });
        }
        Ok(())
    }

    /// Check before starting a stage: actual and projected cost, then the
    /// wall clock.
    pub fn check_before_stage(&self) -> Result<(), BudgetBreach> {
        self.check_cost()?;
        let projected = self.projected_cost();
        if projected > self.limits.max_cost {
            return Err(BudgetBreach::Cost {
                spent: projected,
                limit: self.limits.max_cost,
            });
        }
        self.check()
    }

    /// Check cost and wall-clock ceilings
    pub fn check(&self) -> Result<(), BudgetBreach> {
        self.check_cost()?;

        let elapsed = self.elapsed();
        if elapsed > self.limits.max_execution_time() {
            return Err(BudgetBreach::Time {
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: self.limits.max_execution_time_ms,
            });
        }

        Ok(())
    }

    /// Check one agent call's token usage against the per-agent ceiling
    pub fn check_stage_tokens(&self, stage: Stage, tokens: TokenCounts) -> Result<(), BudgetBreach> {
        if tokens.total > self.limits.max_tokens_per_agent {
            return Err(BudgetBreach::Tokens {
                stage,
                used: tokens.total,
                limit: self.limits.max_tokens_per_agent,
            });
        }
        Ok(())
    }
}
