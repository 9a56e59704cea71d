pub mod mock;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use mock::MockClassifier;

#[cfg(feature = "backend-tract")]
pub use tract::TractClassifier;
