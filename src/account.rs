//! Batch-compute accounts and region routing.
//!
//! Each account identifies one regional Azure Batch service instance. The
//! registry is loaded once at startup and is the only source used to route an
//! incoming region to an account.

use serde::Serialize;
use thiserror::Error;

/// One batch-compute account and the location it serves.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct Account {
    /// Account name as registered with the provider.
    pub name: String,
    /// Provider location (for example `westeurope`), used as the routing key.
    pub location: String,
}

impl Account {
    /// Creates an account, trimming both fields.
    #[must_use]
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_owned(),
            location: location.into().trim().to_owned(),
        }
    }

    /// Base URL of the account's batch service endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("https://{}.{}.batch.azure.com", self.name, self.location)
    }
}

/// Errors raised while building an [`AccountRegistry`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AccountError {
    /// Raised when no accounts were supplied.
    #[error("at least one batch account must be configured")]
    Empty,
    /// Raised when an entry is not of the form `name:location`.
    #[error("invalid batch account entry '{entry}': expected name:location")]
    Malformed {
        /// Entry as written in configuration.
        entry: String,
    },
    /// Raised when two accounts claim the same location.
    #[error("location {location} is served by both {first} and {second}")]
    DuplicateLocation {
        /// Location claimed twice.
        location: String,
        /// First account claiming the location.
        first: String,
        /// Second account claiming the location.
        second: String,
    },
}

/// Static list of accounts, one per location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountRegistry {
    accounts: Vec<Account>,
}

impl AccountRegistry {
    /// Builds a registry, rejecting blank fields and ambiguous locations.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] when the list is empty, an account has a
    /// blank field, or a location appears twice.
    pub fn new(accounts: Vec<Account>) -> Result<Self, AccountError> {
        if accounts.is_empty() {
            return Err(AccountError::Empty);
        }
        for (index, account) in accounts.iter().enumerate() {
            if account.name.is_empty() || account.location.is_empty() {
                return Err(AccountError::Malformed {
                    entry: format!("{}:{}", account.name, account.location),
                });
            }
            if let Some(previous) = accounts
                .iter()
                .take(index)
                .find(|other| other.location == account.location)
            {
                return Err(AccountError::DuplicateLocation {
                    location: account.location.clone(),
                    first: previous.name.clone(),
                    second: account.name.clone(),
                });
            }
        }
        Ok(Self { accounts })
    }

    /// Parses a comma separated list of `name:location` entries.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] when an entry is malformed or the resulting
    /// list fails [`AccountRegistry::new`].
    pub fn parse(spec: &str) -> Result<Self, AccountError> {
        let accounts = spec
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .split_once(':')
                    .map(|(name, location)| Account::new(name, location))
                    .ok_or_else(|| AccountError::Malformed {
                        entry: entry.to_owned(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(accounts)
    }

    /// Returns the account serving `location`, if any.
    #[must_use]
    pub fn for_location(&self, location: &str) -> Option<&Account> {
        let wanted = location.trim();
        self.accounts
            .iter()
            .find(|account| account.location == wanted)
    }

    /// All configured accounts in declaration order.
    #[must_use]
    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parse_reads_name_location_pairs() {
        let registry = AccountRegistry::parse("eu-acc:westeurope, us-acc:eastus")
            .expect("registry should parse");
        assert_eq!(
            registry.accounts(),
            &[
                Account::new("eu-acc", "westeurope"),
                Account::new("us-acc", "eastus")
            ]
        );
    }

    #[rstest]
    #[case("", AccountError::Empty)]
    #[case(" , ", AccountError::Empty)]
    #[case("eu-acc", AccountError::Malformed { entry: String::from("eu-acc") })]
    #[case("eu-acc: ", AccountError::Malformed { entry: String::from("eu-acc:") })]
    fn parse_rejects_invalid_lists(#[case] spec: &str, #[case] expected: AccountError) {
        let err = AccountRegistry::parse(spec).expect_err("spec should be rejected");
        assert_eq!(err, expected);
    }

    #[rstest]
    fn new_rejects_duplicate_locations() {
        let err = AccountRegistry::new(vec![
            Account::new("a", "eu"),
            Account::new("b", "eu"),
        ])
        .expect_err("duplicate location should be rejected");
        assert_eq!(
            err,
            AccountError::DuplicateLocation {
                location: String::from("eu"),
                first: String::from("a"),
                second: String::from("b"),
            }
        );
    }

    #[rstest]
    #[case("eu", Some("eu-acc"))]
    #[case(" eu ", Some("eu-acc"))]
    #[case("us", None)]
    #[case("EU", None)]
    fn for_location_matches_exactly(#[case] region: &str, #[case] expected: Option<&str>) {
        let registry = AccountRegistry::new(vec![Account::new("eu-acc", "eu")])
            .expect("registry should build");
        assert_eq!(
            registry.for_location(region).map(|acc| acc.name.as_str()),
            expected
        );
    }

    #[rstest]
    fn endpoint_combines_name_and_location() {
        assert_eq!(
            Account::new("fleet", "westeurope").endpoint(),
            "https://fleet.westeurope.batch.azure.com"
        );
    }
}
