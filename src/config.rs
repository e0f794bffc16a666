//! Tuning and startup configuration, persisted as JSON.
//!
//! Defaults carry the shipped tuning: relay-derived Ziegler-Nichols
//! gains for the three loops and the stock brew profile.

use crate::filter::Filter;
use crate::pid::Pid;
use crate::profile::DEFAULT_PROFILE;
use crate::types::TICK_PERIOD_MS;
use anyhow::Context;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Level time constant, seconds.
    pub tau: f64,
    /// Rate time constant; None selects single smoothing.
    pub sigma: Option<f64>,
}

impl FilterConfig {
    pub fn build(&self) -> Filter {
        match self.sigma {
            Some(sigma) => Filter::double(self.tau, sigma),
            None => Filter::single(self.tau),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    pub k_p: f64,
    pub t_i: f64,
    pub t_d: f64,
}

impl PidConfig {
    pub fn build(&self) -> Pid {
        Pid::new(self.k_p, self.t_i, self.t_d)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub pressure_filter: FilterConfig,
    pub flow_filter: FilterConfig,
    pub mass_filter: FilterConfig,
    pub temperature_filter: FilterConfig,

    pub pressure_pid: PidConfig,
    pub flow_pid: PidConfig,
    pub temperature_pid: PidConfig,

    /// Startup brew profile, in the profile text format.
    pub profile: String,
    pub tick_period_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            pressure_filter: FilterConfig {
                tau: 0.12,
                sigma: Some(60.0),
            },
            flow_filter: FilterConfig {
                tau: 0.15,
                sigma: None,
            },
            mass_filter: FilterConfig {
                tau: 0.1,
                sigma: None,
            },
            temperature_filter: FilterConfig {
                tau: 1.0,
                sigma: Some(60.0),
            },

            // K_u = 0.5, P_u = 4, classic Ziegler-Nichols.
            pressure_pid: PidConfig {
                k_p: 0.3,
                t_i: 2.0,
                t_d: 0.5,
            },
            // K_u = 0.24, P_u = 0.6, "some overshoot" rule.
            flow_pid: PidConfig {
                k_p: 0.08,
                t_i: 0.3,
                t_d: 0.2,
            },
            // K_u = 0.125, P_u = 16.5.
            temperature_pid: PidConfig {
                k_p: 0.075,
                t_i: 8.25,
                t_d: 2.0625,
            },

            profile: DEFAULT_PROFILE.to_string(),
            tick_period_ms: TICK_PERIOD_MS,
        }
    }
}

impl ControlConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("writing config {}", path.display()))?;

        info!("Saved configuration to {}", path.display());
        Ok(())
    }
}
