//! Event routing
//!
//! Producers and weighted selection decide which events follow a processed one.

mod producer;
mod selector;

pub use producer::{
    EventProducer, EventProducerRegistry, RandomRedirectProducer, RedirectProducer, RoutingError,
    TerminateProducer,
};
pub use selector::{Delay, EventWeight, RandomWeightedSelector, WeightParseError, WeightedEventSelector};
