mod executor;
mod observer;
mod retribution;
mod service;
pub mod sweep;

pub use retribution::{
    BreachedOutput, RetributionInfo, RetributionStore, WitnessGenerator, WitnessType,
};
pub use service::{ArbiterStore, BreachArbiter};

#[cfg(test)]
mod tests;
