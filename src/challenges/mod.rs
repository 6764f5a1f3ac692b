// Aggregates challenge detection and resolution used in front of the portal's lookup form.

pub mod core;
pub mod detectors;
pub mod resolver;

pub use resolver::{ChallengeResolver, ProofProvider, ResolutionError, SingleUseProof};
