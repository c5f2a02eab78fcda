use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of real-time event a subscription streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionCategory {
    /// Task output as it is produced
    TaskOutput,
    /// Callback status changes
    Callback,
    /// File uploads and downloads
    File,
    /// Operational alerts
    Alert,
    Screenshot,
    Keylog,
    /// Process listings reported by agents
    Process,
    Credential,
    Artifact,
    Token,
    /// Catch-all
    All,
}

impl SubscriptionCategory {
    /// Every known category
    pub const ALL: [SubscriptionCategory; 11] = [
        SubscriptionCategory::TaskOutput,
        SubscriptionCategory::Callback,
        SubscriptionCategory::File,
        SubscriptionCategory::Alert,
        SubscriptionCategory::Screenshot,
        SubscriptionCategory::Keylog,
        SubscriptionCategory::Process,
        SubscriptionCategory::Credential,
        SubscriptionCategory::Artifact,
        SubscriptionCategory::Token,
        SubscriptionCategory::All,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionCategory::TaskOutput => "task_output",
            SubscriptionCategory::Callback => "callback",
            SubscriptionCategory::File => "file",
            SubscriptionCategory::Alert => "alert",
            SubscriptionCategory::Screenshot => "screenshot",
            SubscriptionCategory::Keylog => "keylog",
            SubscriptionCategory::Process => "process",
            SubscriptionCategory::Credential => "credential",
            SubscriptionCategory::Artifact => "artifact",
            SubscriptionCategory::Token => "token",
            SubscriptionCategory::All => "all",
        }
    }
}

impl fmt::Display for SubscriptionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| Error::Configuration {
                message: format!("unknown subscription category '{}'", s),
            })
    }
}
