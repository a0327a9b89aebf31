//! Response envelope for decisions surfaced to callers.
//!
//! Every variant is distinct: success and accepted carry a payload,
//! rejected and failed carry structured errors. `accepted` means the
//! terminal outcome is not known yet and the caller should poll.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub reason: String,
    pub msg: String,
}

impl ErrorDetail {
    pub fn new(reason: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome<T> {
    Success {
        data: T,
        #[serde(default)]
        msgs: Vec<String>,
    },
    Accepted {
        data: T,
        #[serde(default)]
        msgs: Vec<String>,
    },
    Rejected {
        errors: Vec<ErrorDetail>,
        #[serde(default)]
        msgs: Vec<String>,
    },
    Failed {
        errors: Vec<ErrorDetail>,
        #[serde(default)]
        msgs: Vec<String>,
    },
}

impl<T> Outcome<T> {
    pub fn success(data: T) -> Self {
        Self::Success {
            data,
            msgs: Vec::new(),
        }
    }

    pub fn accepted(data: T) -> Self {
        Self::Accepted {
            data,
            msgs: Vec::new(),
        }
    }

    pub fn rejected(reason: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Rejected {
            errors: vec![ErrorDetail::new(reason, msg)],
            msgs: Vec::new(),
        }
    }

    pub fn failed(reason: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Failed {
            errors: vec![ErrorDetail::new(reason, msg)],
            msgs: Vec::new(),
        }
    }

    /// Append an informational message.
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        match &mut self {
            Self::Success { msgs, .. }
            | Self::Accepted { msgs, .. }
            | Self::Rejected { msgs, .. }
            | Self::Failed { msgs, .. } => msgs.push(msg.into()),
        }
        self
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether the caller can stop polling.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Accepted { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success { data, .. } | Self::Accepted { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn errors(&self) -> &[ErrorDetail] {
        match self {
            Self::Rejected { errors, .. } | Self::Failed { errors, .. } => errors,
            _ => &[],
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Success { data, msgs } => Outcome::Success { data: f(data), msgs },
            Self::Accepted { data, msgs } => Outcome::Accepted { data: f(data), msgs },
            Self::Rejected { errors, msgs } => Outcome::Rejected { errors, msgs },
            Self::Failed { errors, msgs } => Outcome::Failed { errors, msgs },
        }
    }
}
