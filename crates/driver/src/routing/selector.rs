//! Weighted random selection
//!
//! Uses the cumulative-weight technique: draw `u * total` for a uniform
//! `u` in `[0, 1)` and take the first candidate whose cumulative weight
//! exceeds the draw.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventData};

/// Picks candidates with probability proportional to their weight
#[derive(Debug, Clone)]
pub struct RandomWeightedSelector<T> {
    /// Candidates with their cumulative weight, ascending
    entries: Vec<(f64, T)>,
    total: f64,
}

impl<T> RandomWeightedSelector<T> {
    /// Build a selector; candidates with a weight of zero or less (or NaN) are dropped
    pub fn new(candidates: impl IntoIterator<Item = (f64, T)>) -> Self {
        let mut entries = Vec::new();
        let mut total = 0.0;
        for (weight, item) in candidates {
            if !weight.is_finite() || weight <= 0.0 {
                continue;
            }
            total += weight;
            entries.push((total, item));
        }
        Self { entries, total }
    }

    /// Sum of all positive weights
    pub fn total_weight(&self) -> f64 {
        self.total
    }

    /// Number of selectable candidates
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Select using the thread-local generator
    pub fn select(&self) -> Option<&T> {
        self.select_with(&mut rand::thread_rng())
    }

    /// Select using the given generator
    pub fn select_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&T> {
        if self.entries.is_empty() || self.total <= 0.0 {
            return None;
        }
        let draw = rng.gen::<f64>() * self.total;
        let index = self.entries.partition_point(|(cumulative, _)| *cumulative <= draw);
        // Rounding can leave the draw at the very top of the range
        let index = index.min(self.entries.len() - 1);
        Some(&self.entries[index].1)
    }
}

/// Scheduling delay of a weighted successor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delay {
    /// Schedule immediately
    None,

    /// Fixed delay
    Fixed {
        #[serde(with = "duration_millis")]
        delay: Duration,
    },

    /// Uniformly random delay in `[min, max]`
    Range {
        #[serde(with = "duration_millis")]
        min: Duration,
        #[serde(with = "duration_millis")]
        max: Duration,
    },
}

impl Delay {
    /// Draw a concrete delay
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay } => delay,
            Self::Range { min, max } if max > min => {
                let millis = rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
                Duration::from_millis(millis)
            }
            Self::Range { min, .. } => min,
        }
    }
}

/// Error parsing a weight or successor expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WeightParseError {
    /// Missing event name
    #[error("successor expression has no event name: '{0}'")]
    MissingName(String),

    /// Field is not a number
    #[error("invalid number '{value}' in '{expression}'")]
    InvalidNumber { expression: String, value: String },

    /// Too many fields
    #[error("too many fields in successor expression: '{0}'")]
    TooManyFields(String),
}

/// A weighted route to a named event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventWeight {
    pub event_name: String,
    pub weight: f64,
    pub delay: Delay,
}

impl EventWeight {
    /// Route with a plain weight and no delay
    pub fn new(event_name: impl Into<String>, weight: f64) -> Self {
        Self {
            event_name: event_name.into(),
            weight,
            delay: Delay::None,
        }
    }

    /// Route whose weight is the product of comma-separated factors, e.g. `"1.0, 0.5"`
    pub fn from_weights(
        event_name: impl Into<String>,
        weights: &str,
    ) -> Result<Self, WeightParseError> {
        let mut weight = 1.0;
        for factor in weights.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            weight *= parse_number(weights, factor)?;
        }
        Ok(Self::new(event_name, weight))
    }

    /// Route weighted by an integer percentage
    ///
    /// Percentages are relative weights on the same scale as any other
    /// weight, so `25` next to a weight of `75.0` is picked a quarter of the time.
    pub fn with_percentage(event_name: impl Into<String>, percent: u32) -> Self {
        Self::new(event_name, f64::from(percent))
    }

    /// Parse `name,weight[,delay_ms[,max_delay_ms]]`
    ///
    /// One delay field is a fixed delay; two form a random `min,max` range.
    pub fn parse(expression: &str) -> Result<Self, WeightParseError> {
        let fields: Vec<&str> = expression.split(',').map(str::trim).collect();
        let name = fields
            .first()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| WeightParseError::MissingName(expression.to_string()))?;

        let weight = match fields.get(1) {
            Some(value) => parse_number(expression, value)?,
            None => 1.0,
        };

        let millis = |value: &str| -> Result<Duration, WeightParseError> {
            let ms = parse_number(expression, value)?;
            Ok(Duration::from_millis(ms.max(0.0) as u64))
        };
        let delay = match &fields[fields.len().min(2)..] {
            [] => Delay::None,
            [fixed] => Delay::Fixed {
                delay: millis(*fixed)?,
            },
            [min, max] => {
                let (min, max) = (millis(*min)?, millis(*max)?);
                Delay::Range {
                    min: min.min(max),
                    max: min.max(max),
                }
            }
            _ => return Err(WeightParseError::TooManyFields(expression.to_string())),
        };

        Ok(Self {
            event_name: name.to_string(),
            weight,
            delay,
        })
    }

    /// Set a fixed delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Delay::Fixed { delay };
        self
    }

    /// Set a random delay range
    pub fn with_delay_range(mut self, min: Duration, max: Duration) -> Self {
        self.delay = Delay::Range {
            min: min.min(max),
            max: min.max(max),
        };
        self
    }
}

fn parse_number(expression: &str, value: &str) -> Result<f64, WeightParseError> {
    value
        .parse::<f64>()
        .map_err(|_| WeightParseError::InvalidNumber {
            expression: expression.to_string(),
            value: value.to_string(),
        })
}

/// Chooses the next event among weighted successors
#[derive(Debug, Clone)]
pub struct WeightedEventSelector {
    selector: RandomWeightedSelector<EventWeight>,
}

impl WeightedEventSelector {
    /// Build from successor routes
    pub fn new(successors: impl IntoIterator<Item = EventWeight>) -> Self {
        Self {
            selector: RandomWeightedSelector::new(
                successors.into_iter().map(|s| (s.weight, s)),
            ),
        }
    }

    /// Build from `name,weight[,delay[,max_delay]]` expressions
    pub fn parse<'a>(
        expressions: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, WeightParseError> {
        let successors = expressions
            .into_iter()
            .map(EventWeight::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(successors))
    }

    pub fn is_empty(&self) -> bool {
        self.selector.is_empty()
    }

    /// Pick the next event carrying `data`; `None` when nothing is selectable
    pub fn next_event(&self, data: EventData, now: DateTime<Utc>) -> Option<Event> {
        self.next_event_with(&mut rand::thread_rng(), data, now)
    }

    /// Pick the next event using the given generator
    pub fn next_event_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        data: EventData,
        now: DateTime<Utc>,
    ) -> Option<Event> {
        let successor = self.selector.select_with(rng)?.clone();
        let delay = successor.delay.sample(rng);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        Some(Event::new(successor.event_name, now + delay, data))
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
