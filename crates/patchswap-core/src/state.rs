use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Numeric failure reason carried by a `failed: <code>` status token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureCode(pub u32);

impl FailureCode {
    pub const UNEXPECTED: Self = Self(1);
    pub const READ_ERROR: Self = Self(6);
    pub const WRITE_ERROR: Self = Self(7);
    pub const DISK_FULL: Self = Self(9);
    pub const LOCK_CONTENTION: Self = Self(12);
    pub const OPERATION_CONFLICT: Self = Self(13);
    pub const INTEGRITY_FAILURE: Self = Self(14);
    pub const MERGE_FAILURE: Self = Self(15);
    pub const OLDER_THAN_INSTALLED: Self = Self(21);

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UpdateState {
    Pending,
    PendingService,
    Applying,
    Applied,
    AppliedService,
    Succeeded,
    Failed(FailureCode),
}

impl UpdateState {
    /// Renders the single-line token stored in the status record.
    pub fn as_status_token(&self) -> String {
        match self {
            Self::Pending => "pending".to_string(),
            Self::PendingService => "pending-service".to_string(),
            Self::Applying => "applying".to_string(),
            Self::Applied => "applied".to_string(),
            Self::AppliedService => "applied-service".to_string(),
            Self::Succeeded => "succeeded".to_string(),
            Self::Failed(code) => format!("failed: {code}"),
        }
    }

    pub fn parse_status_token(raw: &str) -> Result<Self, UpdateError> {
        let token = raw.trim();
        let lowered = token.to_ascii_lowercase();
        let state = match lowered.as_str() {
            "pending" => Self::Pending,
            "pending-service" => Self::PendingService,
            "applying" => Self::Applying,
            "applied" => Self::Applied,
            "applied-service" => Self::AppliedService,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed(FailureCode::UNEXPECTED),
            other => {
                let Some(code) = other.strip_prefix("failed:") else {
                    return Err(UpdateError::MalformedManifest(format!(
                        "unknown status token '{token}'"
                    )));
                };
                let code = code.trim().parse::<u32>().map_err(|_| {
                    UpdateError::MalformedManifest(format!(
                        "invalid failure code in status token '{token}'"
                    ))
                })?;
                Self::Failed(FailureCode(code))
            }
        };
        Ok(state)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::PendingService)
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied | Self::AppliedService)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }

    /// States in which a new apply attempt must not run.
    pub fn is_terminal_for_apply(&self) -> bool {
        self.is_applied() || self.is_terminal()
    }
}

impl TryFrom<String> for UpdateState {
    type Error = UpdateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_status_token(&value)
    }
}

impl From<UpdateState> for String {
    fn from(value: UpdateState) -> Self {
        value.as_status_token()
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_status_token())
    }
}
