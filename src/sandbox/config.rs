//! Sandbox configuration with builder pattern.

use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Configuration for a sandbox session.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum interpreter heap in bytes.
    pub max_memory: usize,
    /// Maximum interpreter stack size in bytes.
    pub max_stack_size: usize,
    /// Lower bound for repeating timer periods.
    pub min_timer_interval: Duration,
    /// Maximum nesting depth when converting results to host values.
    pub max_value_depth: usize,
    /// Name of the thread hosting the interpreter.
    pub thread_name: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024, // 64MB
            max_stack_size: 512 * 1024,
            min_timer_interval: Duration::from_millis(4),
            max_value_depth: 64,
            thread_name: "cellbox-sandbox".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Reject limits the interpreter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_memory == 0 {
            return Err(SandboxError::Config("max_memory must be non-zero".to_string()));
        }
        if self.max_stack_size == 0 {
            return Err(SandboxError::Config(
                "max_stack_size must be non-zero".to_string(),
            ));
        }
        if self.max_value_depth == 0 {
            return Err(SandboxError::Config(
                "max_value_depth must be non-zero".to_string(),
            ));
        }
        if self.min_timer_interval.is_zero() {
            return Err(SandboxError::Config(
                "min_timer_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    max_memory: Option<usize>,
    max_stack_size: Option<usize>,
    min_timer_interval: Option<Duration>,
    max_value_depth: Option<usize>,
    thread_name: Option<String>,
}

impl SandboxConfigBuilder {
    /// Set the maximum heap size in bytes.
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the maximum stack size in bytes.
    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    /// Set the shortest period a repeating timer may use.
    pub fn min_timer_interval(mut self, interval: Duration) -> Self {
        self.min_timer_interval = Some(interval);
        self
    }

    /// Set the maximum depth of converted result values.
    pub fn max_value_depth(mut self, depth: usize) -> Self {
        self.max_value_depth = Some(depth);
        self
    }

    /// Set the interpreter thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();
        SandboxConfig {
            max_memory: self.max_memory.unwrap_or(default.max_memory),
            max_stack_size: self.max_stack_size.unwrap_or(default.max_stack_size),
            min_timer_interval: self.min_timer_interval.unwrap_or(default.min_timer_interval),
            max_value_depth: self.max_value_depth.unwrap_or(default.max_value_depth),
            thread_name: self.thread_name.unwrap_or(default.thread_name),
        }
    }
}
