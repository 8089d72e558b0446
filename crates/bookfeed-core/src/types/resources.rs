//! Worker resource ceilings and point-in-time usage samples.

use serde::{Deserialize, Serialize};

use super::enums::ExchangeClass;

/// Soft/hard ceilings enforced on one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// RSS in MB above which a warning callback fires.
    pub memory_soft_limit_mb: u64,
    /// RSS in MB above which the worker is restarted.
    pub memory_hard_limit_mb: u64,
    pub cpu_limit_percent: f64,
    pub max_connections: u32,
    pub max_file_descriptors: u32,
}

impl ResourceLimits {
    /// Default ceilings for an exchange class.
    ///
    /// | class            | soft MB | hard MB | connections |
    /// |------------------|---------|---------|-------------|
    /// | derivatives_high | 150     | 200     | 20          |
    /// | spot_high        | 100     | 140     | 12          |
    /// | low_frequency    | 60      | 100     | 5           |
    pub fn for_class(class: ExchangeClass) -> Self {
        match class {
            ExchangeClass::DerivativesHigh => Self {
                memory_soft_limit_mb: 150,
                memory_hard_limit_mb: 200,
                cpu_limit_percent: 80.0,
                max_connections: 20,
                max_file_descriptors: 256,
            },
            ExchangeClass::SpotHigh => Self {
                memory_soft_limit_mb: 100,
                memory_hard_limit_mb: 140,
                cpu_limit_percent: 60.0,
                max_connections: 12,
                max_file_descriptors: 128,
            },
            ExchangeClass::LowFrequency => Self {
                memory_soft_limit_mb: 60,
                memory_hard_limit_mb: 100,
                cpu_limit_percent: 30.0,
                max_connections: 5,
                max_file_descriptors: 64,
            },
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::for_class(ExchangeClass::SpotHigh)
    }
}

/// Per-field overrides applied on top of the class defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimitOverrides {
    pub memory_soft_limit_mb: Option<u64>,
    pub memory_hard_limit_mb: Option<u64>,
    pub cpu_limit_percent: Option<f64>,
    pub max_connections: Option<u32>,
    pub max_file_descriptors: Option<u32>,
}

impl ResourceLimitOverrides {
    pub fn apply(&self, base: ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_soft_limit_mb: self.memory_soft_limit_mb.unwrap_or(base.memory_soft_limit_mb),
            memory_hard_limit_mb: self.memory_hard_limit_mb.unwrap_or(base.memory_hard_limit_mb),
            cpu_limit_percent: self.cpu_limit_percent.unwrap_or(base.cpu_limit_percent),
            max_connections: self.max_connections.unwrap_or(base.max_connections),
            max_file_descriptors: self.max_file_descriptors.unwrap_or(base.max_file_descriptors),
        }
    }
}

/// One resource sample of a worker process. Only the latest sample is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
    pub connection_count: u32,
    pub fd_count: u32,
    /// Sample time in microseconds since Unix epoch.
    pub sampled_at_us: u64,
}
