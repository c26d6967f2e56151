//! Worker configuration from environment variables

use std::time::Duration;

use anyhow::{bail, Context, Result};
use benchrun_driver::ControllerConfig;
use serde::{Deserialize, Serialize};

/// Which store backs the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Postgres,
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => bail!("unknown store '{other}', expected 'memory' or 'postgres'"),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub store: StoreKind,
    pub database_url: Option<String>,
    /// Wipe the tables before the run
    pub reset: bool,
    pub driver_id: Option<String>,
    /// Other drivers sharing the run, for follow-up pinning
    pub driver_ids: Vec<String>,
    pub thread_count: usize,
    pub events_per_second_per_thread: u32,
    /// Number of `work` events the scenario raises
    pub event_count: u64,
    /// Upper bound of each simulated operation
    pub work_millis: u64,
    /// Spacing of raised `work` events
    pub event_spacing_millis: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            database_url: None,
            reset: false,
            driver_id: None,
            driver_ids: Vec::new(),
            thread_count: 4,
            events_per_second_per_thread: 50,
            event_count: 100,
            work_millis: 20,
            event_spacing_millis: 10,
        }
    }
}

impl WorkerConfig {
    /// Read `BENCHRUN_*` variables (and `DATABASE_URL`), falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let store = match lookup("BENCHRUN_STORE") {
            Some(value) => value.parse()?,
            None => defaults.store,
        };

        let database_url = lookup("DATABASE_URL");
        if store == StoreKind::Postgres && database_url.is_none() {
            bail!("DATABASE_URL must be set when BENCHRUN_STORE=postgres");
        }

        let driver_ids = lookup("BENCHRUN_DRIVER_IDS")
            .map(|ids| {
                ids.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            store,
            database_url,
            reset: parse(&lookup, "BENCHRUN_RESET")?.unwrap_or(defaults.reset),
            driver_id: lookup("BENCHRUN_DRIVER_ID"),
            driver_ids,
            thread_count: parse(&lookup, "BENCHRUN_THREAD_COUNT")?.unwrap_or(defaults.thread_count),
            events_per_second_per_thread: parse(&lookup, "BENCHRUN_EVENTS_PER_SECOND_PER_THREAD")?
                .unwrap_or(defaults.events_per_second_per_thread),
            event_count: parse(&lookup, "BENCHRUN_EVENT_COUNT")?.unwrap_or(defaults.event_count),
            work_millis: parse(&lookup, "BENCHRUN_WORK_MILLIS")?.unwrap_or(defaults.work_millis),
            event_spacing_millis: parse(&lookup, "BENCHRUN_EVENT_SPACING_MILLIS")?
                .unwrap_or(defaults.event_spacing_millis),
        })
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let mut config = ControllerConfig::new()
            .with_thread_count(self.thread_count)
            .with_events_per_second_per_thread(self.events_per_second_per_thread)
            .with_driver_ids(self.driver_ids.clone());
        if let Some(driver_id) = &self.driver_id {
            config = config.with_driver_id(driver_id.clone());
        }
        config
    }

    pub fn event_spacing(&self) -> Duration {
        Duration::from_millis(self.event_spacing_millis)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {key}: '{value}'"))
        })
        .transpose()
}
