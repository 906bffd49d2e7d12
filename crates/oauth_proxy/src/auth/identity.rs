use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::GatewayError;

/// Supported identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    GitHub,
    GitLab,
    Bitbucket,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::GitHub, Self::GitLab, Self::Bitbucket];

    /// Route segment and display key of the provider
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Bitbucket => "bitbucket",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::GitHub => "GitHub",
            Self::GitLab => "GitLab",
            Self::Bitbucket => "Bitbucket",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Self::GitHub),
            "gitlab" => Ok(Self::GitLab),
            "bitbucket" => Ok(Self::Bitbucket),
            _ => Err(GatewayError::UnknownProvider(s.to_string())),
        }
    }
}

/// An authenticated user as reported by an identity provider.
///
/// Organization names are stored lower-cased so membership checks are
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    provider: ProviderKind,
    subject_id: String,
    username: String,
    organizations: BTreeSet<String>,
}

impl Identity {
    pub fn new<I, S>(
        provider: ProviderKind,
        subject_id: impl Into<String>,
        username: impl Into<String>,
        organizations: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            provider,
            subject_id: subject_id.into(),
            username: username.into(),
            organizations: organizations
                .into_iter()
                .map(|org| org.as_ref().trim().to_lowercase())
                .filter(|org| !org.is_empty())
                .collect(),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Provider-unique account id; stable across username changes
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn organizations(&self) -> impl Iterator<Item = &str> {
        self.organizations.iter().map(String::as_str)
    }

    /// True when `allowed` is empty or shares at least one organization with this identity.
    pub fn is_member_of_any(&self, allowed: &HashSet<String>) -> bool {
        allowed.is_empty()
            || allowed
                .iter()
                .any(|org| self.organizations.contains(&org.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("GitHub".parse::<ProviderKind>().unwrap(), ProviderKind::GitHub);
        assert_eq!("gitlab".parse::<ProviderKind>().unwrap(), ProviderKind::GitLab);
        assert!(matches!(
            "google".parse::<ProviderKind>(),
            Err(GatewayError::UnknownProvider(name)) if name == "google"
        ));
    }

    #[test]
    fn test_org_membership_is_case_insensitive() {
        let identity = Identity::new(ProviderKind::GitHub, "583231", "octocat", ["ACME", "Other"]);
        let allowed: HashSet<String> = ["acme".to_string()].into_iter().collect();
        assert!(identity.is_member_of_any(&allowed));

        let allowed: HashSet<String> = ["Other".to_string()].into_iter().collect();
        assert!(identity.is_member_of_any(&allowed));

        let allowed: HashSet<String> = ["initech".to_string()].into_iter().collect();
        assert!(!identity.is_member_of_any(&allowed));
    }

    #[test]
    fn test_empty_allow_list_permits_everyone() {
        let identity = Identity::new(ProviderKind::Bitbucket, "{b7f1}", "alice", Vec::<String>::new());
        assert!(identity.is_member_of_any(&HashSet::new()));
    }
}
