pub mod replay;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use replay::ReplayModel;

#[cfg(feature = "backend-tract")]
pub use tract::TractModel;
