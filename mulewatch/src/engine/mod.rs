pub mod fusion;
pub mod mule;

pub use fusion::FusionEngine;
pub use mule::MuleClassifier;
