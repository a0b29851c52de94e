//! Dataset identifiers (DIDs).
//!
//! A DID names a dataset in an external catalog. It has the form
//! `scheme://name`; when the scheme is omitted the configured default
//! scheme applies. Anything after a `?` is a resolver hint and does not
//! take part in dataset identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix appended to the scheme to form the resolver queue name.
pub const RESOLVER_QUEUE_SUFFIX: &str = "_did_requests";

/// A parsed, scheme-qualified dataset identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Did {
    scheme: String,
    name: String,
}

impl Did {
    /// Parses a raw DID string.
    ///
    /// Query suffixes (`?files=10`) are stripped from the name. A string
    /// without `scheme://` gets `default_scheme`.
    #[must_use]
    pub fn parse(raw: &str, default_scheme: &str) -> Self {
        let raw = raw.trim();
        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest))
                if !scheme.is_empty()
                    && scheme.chars().all(|c| c.is_alphanumeric() || c == '_') =>
            {
                (scheme.to_string(), rest)
            }
            _ => (default_scheme.to_string(), raw),
        };
        let name = rest.split_once('?').map_or(rest, |(name, _)| name);
        Self {
            scheme,
            name: name.to_string(),
        }
    }

    /// The scheme, which selects the resolver.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The catalog-specific dataset name, without scheme or query suffix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical `scheme://name` form used as the dataset's unique name.
    #[must_use]
    pub fn full_did(&self) -> String {
        format!("{}://{}", self.scheme, self.name)
    }

    /// Name of the broker queue served by this scheme's resolver.
    #[must_use]
    pub fn resolver_queue(&self) -> String {
        format!("{}{RESOLVER_QUEUE_SUFFIX}", self.scheme)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.name)
    }
}
