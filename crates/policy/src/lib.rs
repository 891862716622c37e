//! Policy inputs for classification: what is denied, which licenses are
//! acceptable, and which frameworks a package targets.
//!
//! Lists are loaded once per run and then treated as immutable snapshots.

mod deny;
pub mod error;
mod framework;
mod license;

pub use crate::deny::{DenyList, DenyRule};
pub use crate::framework::{Detection, FrameworkDetector, FrameworkRule, Signal, default_frameworks};
pub use crate::license::{DEFAULT_LICENSES, LicenseList, UNLICENSED};
