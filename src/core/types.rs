use serde::{Deserialize, Serialize};

/// Caller-assigned identifier for a stored consensus sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid(pub String);

impl Guid {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Guid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable identifier of a cluster within one clustering algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which ambiguity symbols count as uncertain when computing mixture
/// statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertainChar {
    /// Only `N` calls
    N,
    /// Only IUPAC mixed-base calls
    M,
    /// Either kind
    NOrM,
}

impl std::fmt::Display for UncertainChar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::N => write!(f, "N"),
            Self::M => write!(f, "M"),
            Self::NOrM => write!(f, "N_or_M"),
        }
    }
}

/// Rule governing whether mixed samples can link clusters together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixturePolicy {
    /// Mixed samples cluster exactly like unmixed ones
    IncludeMixed,
    /// Mixed samples are permanent singletons
    ExcludeMixed,
    /// Mixed samples attach to a cluster but never bridge two clusters
    ExcludeMixedFromGrowth,
}

impl std::fmt::Display for MixturePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncludeMixed => write!(f, "include_mixed"),
            Self::ExcludeMixed => write!(f, "exclude_mixed"),
            Self::ExcludeMixedFromGrowth => write!(f, "exclude_mixed_from_growth"),
        }
    }
}

/// Record shape returned by neighbour queries.
///
/// The numeric codes match the wire formats the REST adapter exposes:
/// `1` id only, `2` `[id, snv]`, `3` `[id, snv, quality]`,
/// `4` `[id, snv, quality, meta]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighbourFormat {
    IdOnly,
    IdDistance,
    IdDistanceQuality,
    IdDistanceQualityMeta,
}

impl NeighbourFormat {
    /// Resolve a numeric format code (1-4) from the query string.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::IdOnly),
            2 => Some(Self::IdDistance),
            3 => Some(Self::IdDistanceQuality),
            4 => Some(Self::IdDistanceQualityMeta),
            _ => None,
        }
    }
}
