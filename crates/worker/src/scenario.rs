//! Sample load scenario
//!
//! `start` raises `work` events at a fixed spacing. Each `work` event borrows a
//! user from the fixture, simulates an operation of random length and reports
//! `work.done`, which is routed either to `report` or dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use benchrun_driver::prelude::*;
use chrono::Utc;
use rand::Rng;
use serde_json::json;

use crate::config::WorkerConfig;

pub const EVENT_NAME_WORK: &str = "work";
pub const EVENT_NAME_WORK_DONE: &str = "work.done";
pub const EVENT_NAME_REPORT: &str = "report";
pub const EVENT_NAME_TERMINATE: &str = "terminate";

/// Percentage of completed work that is reported
const REPORT_PERCENT: u32 = 10;

/// Simulated operation against a fixture user
pub struct WorkProcessor {
    users: Arc<dyn FixtureSource<String>>,
    max_millis: u64,
}

impl WorkProcessor {
    pub fn new(users: Arc<dyn FixtureSource<String>>, max_millis: u64) -> Self {
        Self {
            users,
            max_millis: max_millis.max(1),
        }
    }
}

#[async_trait]
impl EventProcessor for WorkProcessor {
    fn name(&self) -> &str {
        "work"
    }

    fn options(&self) -> ProcessorOptions {
        ProcessorOptions::default().with_warn_delay(Duration::from_millis(self.max_millis * 2))
    }

    async fn process_event(
        &self,
        _event: &Event,
        timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        // Fixture lookups are not part of the measured operation
        timer.suspend();
        let user = self.users.fetch().await;
        timer.resume();

        let Some(user) = user else {
            return Ok(EventResult::skipped("no fixture users available"));
        };

        let millis = rand::thread_rng().gen_range(1..=self.max_millis);
        tokio::time::sleep(Duration::from_millis(millis)).await;

        Ok(EventResult::success(json!({ "user": user, "millis": millis })).with_next_event(
            Event::new(EVENT_NAME_WORK_DONE, Utc::now(), json!({ "user": user })),
        ))
    }
}

/// Acknowledges a reported unit of work
pub struct ReportProcessor;

#[async_trait]
impl EventProcessor for ReportProcessor {
    fn name(&self) -> &str {
        "report"
    }

    fn options(&self) -> ProcessorOptions {
        ProcessorOptions::default().with_chart(false)
    }

    async fn process_event(
        &self,
        event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        let user = event
            .data
            .as_value()
            .and_then(|data| data.get("user"))
            .cloned()
            .unwrap_or_default();
        Ok(EventResult::success(json!({ "reported": user })))
    }
}

/// Processors and producers for the sample scenario
pub fn build(config: &WorkerConfig) -> Result<(ProcessorRegistry, EventProducerRegistry)> {
    let users: Vec<String> = (1..=10).map(|n| format!("user{n:02}")).collect();
    let users: Arc<dyn FixtureSource<String>> = Arc::new(VecFixtureSource::new(users));

    let raise = Arc::new(RaiseEventsProcessor::new(
        EVENT_NAME_WORK,
        config.event_spacing(),
        config.event_count,
    ));

    let mut processors = ProcessorRegistry::new();
    processors.register_arc(EVENT_NAME_START, raise.clone())?;
    processors.register_arc(EVENT_NAME_RAISE_EVENTS, raise)?;
    processors.register(EVENT_NAME_WORK, WorkProcessor::new(users, config.work_millis))?;
    processors.register(EVENT_NAME_REPORT, ReportProcessor)?;

    let mut producers = EventProducerRegistry::new();
    producers.register(
        EVENT_NAME_WORK_DONE,
        RandomRedirectProducer::new([
            EventWeight::with_percentage(EVENT_NAME_REPORT, REPORT_PERCENT),
            EventWeight::with_percentage(EVENT_NAME_TERMINATE, 100 - REPORT_PERCENT),
        ]),
    )?;
    producers.register(EVENT_NAME_TERMINATE, TerminateProducer)?;

    Ok((processors, producers))
}
