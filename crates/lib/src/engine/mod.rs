//! Production implementations of the collaborator traits.

mod helm;

pub use helm::HelmEngine;
