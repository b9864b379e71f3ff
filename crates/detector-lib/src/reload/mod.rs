//! Hot reload of model bundles
//!
//! [`HotReloadCoordinator`] is the single owner of the active bundle. It
//! moves between Unloaded, Ready and Degraded as loads succeed or fail, and
//! never drops a working bundle because a later load failed.

mod coordinator;


pub use coordinator::{
    DetectorInfo, DetectorState, HotReloadCoordinator, Prediction, ServingState,
};
