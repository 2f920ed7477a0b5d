//! Installation policy
//!
//! Controls whether building a binding runs its first-use installation.

use serde::{Deserialize, Serialize};

/// When to run [`crate::binding::Binding::install`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstallOption {
    /// Never install, even if the binding was never set up
    NeverInstall,
    /// Install only when no install marker is present
    #[default]
    InstallIfNecessary,
    /// Always reinstall
    ForceInstall,
}

impl InstallOption {
    /// Whether installation should run given the current marker state
    pub fn should_install(self, installed: bool) -> bool {
        match self {
            InstallOption::NeverInstall => false,
            InstallOption::InstallIfNecessary => !installed,
            InstallOption::ForceInstall => true,
        }
    }
}
