//! Confirmation policy: which tools wait for a human before they run

use std::collections::BTreeSet;

/// Tool name gated by default; the backend ships it without an executor.
pub const DEFAULT_GATED_TOOL: &str = "getWeatherInformation";

/// The set of tool names whose calls need human confirmation.
///
/// Must be the exact complement of the tools the backend executes on its own.
/// The reconciler trusts it without checking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    required: BTreeSet<String>,
}

impl ConfirmationPolicy {
    /// Create a policy from a list of gated tool names
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: tools.into_iter().map(Into::into).collect(),
        }
    }

    /// A policy that gates nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether calls to `tool_name` wait for confirmation
    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        self.required.contains(tool_name)
    }

    /// Gated tool names, sorted
    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    /// Compare this policy against the set a backend advertises
    pub fn drift(&self, advertised: &ConfirmationPolicy) -> PolicyDrift {
        PolicyDrift {
            only_local: self
                .required
                .difference(&advertised.required)
                .cloned()
                .collect(),
            only_remote: advertised
                .required
                .difference(&self.required)
                .cloned()
                .collect(),
        }
    }
}

/// Tools gated on one side but not the other
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDrift {
    /// Gated locally, auto-executed by the backend
    pub only_local: Vec<String>,
    /// Gated by the backend, treated as autonomous locally
    pub only_remote: Vec<String>,
}

impl PolicyDrift {
    pub fn is_empty(&self) -> bool {
        self.only_local.is_empty() && self.only_remote.is_empty()
    }
}
