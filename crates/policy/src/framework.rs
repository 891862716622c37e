//! Construct framework detection.
//!
//! Tags a version with the construct frameworks it targets. A version is
//! tagged for a framework if any one of these holds:
//!
//! 1. its name is one of the framework's packages,
//! 2. its name starts with one of the framework's prefixes,
//! 3. one of its keywords is a framework keyword,
//! 4. it has a runtime or peer dependency on a framework package,
//! 5. it has a dev dependency on a framework package.
//!
//! Tagging is informational: it never causes a version to be rejected.

use regmirror_registry::VersionInfo;
use serde::{Deserialize, Serialize};

/// The packages, name prefixes and keywords that identify one framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkRule {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl FrameworkRule {
    fn owns(&self, package: &str) -> Option<Signal> {
        if self.packages.iter().any(|p| p == package) {
            Some(Signal::Name)
        } else if self.prefixes.iter().any(|p| package.starts_with(p.as_str())) {
            Some(Signal::Prefix)
        } else {
            None
        }
    }

    fn signal(&self, info: &VersionInfo) -> Option<Signal> {
        if let Some(signal) = self.owns(&info.name) {
            return Some(signal);
        }
        if info.keywords.iter().any(|k| self.keywords.iter().any(|fk| fk.eq_ignore_ascii_case(k.trim()))) {
            return Some(Signal::Keyword);
        }
        if info.dependencies.keys().chain(info.peer_dependencies.keys()).any(|dep| self.owns(dep).is_some()) {
            return Some(Signal::Dependency);
        }
        if info.dev_dependencies.keys().any(|dep| self.owns(dep).is_some()) {
            return Some(Signal::DevDependency);
        }
        None
    }
}

/// Which rule caused a framework tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    Name,
    Prefix,
    Keyword,
    Dependency,
    DevDependency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub framework: String,
    pub signal: Signal,
}

/// Built-in rules for the aws-cdk, cdk8s and cdktf construct families.
pub fn default_frameworks() -> Vec<FrameworkRule> {
    let rule = |name: &str, packages: &[&str], prefixes: &[&str], keywords: &[&str]| FrameworkRule {
        name: name.to_string(),
        packages: packages.iter().map(ToString::to_string).collect(),
        prefixes: prefixes.iter().map(ToString::to_string).collect(),
        keywords: keywords.iter().map(ToString::to_string).collect(),
    };
    vec![
        rule("aws-cdk", &["aws-cdk-lib", "monocdk"], &["@aws-cdk/"], &["aws-cdk", "awscdk"]),
        rule("cdk8s", &["cdk8s", "cdk8s-plus"], &["cdk8s-plus-", "@cdk8s/"], &["cdk8s"]),
        rule("cdktf", &["cdktf"], &["@cdktf/"], &["cdktf"]),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkDetector {
    rules: Vec<FrameworkRule>,
}

impl FrameworkDetector {
    pub fn new(rules: Vec<FrameworkRule>) -> Self {
        Self { rules }
    }

    /// Every framework `info` is tagged with, in rule order.
    pub fn detect(&self, info: &VersionInfo) -> Vec<Detection> {
        self.rules
            .iter()
            .filter_map(|rule| {
                rule.signal(info).map(|signal| Detection {
                    framework: rule.name.clone(),
                    signal,
                })
            })
            .collect()
    }
}
impl Default for FrameworkDetector {
    fn default() -> Self {
        Self::new(default_frameworks())
    }
}
