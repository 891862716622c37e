//! Version classification.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use regmirror_config::PolicyConfig;
use regmirror_policy::{DenyList, Detection, FrameworkDetector, LicenseList, UNLICENSED};
use regmirror_registry::VersionInfo;
use regmirror_storage::BackendHandle;

/// Why a version was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Not a jsii package; nothing for us to do with it.
    NotRelevant,
    DenyListed { reason: String },
    License { license: String },
}
impl Rejection {
    /// Stable identifier used in run reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotRelevant => "not-relevant",
            Self::DenyListed { .. } => "deny-listed",
            Self::License { .. } => "license",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Accepted, tagged with the frameworks it targets (possibly none).
    Accepted { frameworks: Vec<Detection> },
    Rejected(Rejection),
}

/// The policy snapshot a run classifies against.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub deny_list: DenyList,
    pub licenses: LicenseList,
    pub frameworks: FrameworkDetector,
}

impl Policy {
    /// Load the deny and license lists from storage.
    pub async fn load(backend: &BackendHandle, config: &PolicyConfig) -> Result<Self> {
        let deny_list = DenyList::load(backend, &config.deny_list_key).await.or_raise(|| ErrorKind::Policy)?;
        let licenses = LicenseList::load(backend, &config.license_list_key).await.or_raise(|| ErrorKind::Policy)?;
        Ok(Self {
            deny_list,
            licenses,
            frameworks: FrameworkDetector::new(config.frameworks.clone()),
        })
    }

    /// Classify a single version. Pure: no I/O, no state.
    pub fn classify(&self, info: &VersionInfo) -> Classification {
        if !info.is_jsii() {
            return Classification::Rejected(Rejection::NotRelevant);
        }
        if let Some(rule) = self.deny_list.lookup(&info.name, &info.version) {
            return Classification::Rejected(Rejection::DenyListed {
                reason: rule.reason.clone(),
            });
        }
        if !self.licenses.allows(info.license.as_deref()) {
            return Classification::Rejected(Rejection::License {
                license: info.license.clone().unwrap_or_else(|| UNLICENSED.to_string()),
            });
        }
        Classification::Accepted {
            frameworks: self.frameworks.detect(info),
        }
    }
}
