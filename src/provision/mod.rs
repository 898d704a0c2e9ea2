//! Provisioning: which synchronization artifacts to create or drop

mod engine;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A kind of artifact the provisioning engine manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provision {
    /// The user table itself
    Table,
    TrackingTable,
    Triggers,
    StoredProcedures,
    ClientScope,
    ServerScope,
    ServerHistoryScope,
}

impl Provision {
    pub fn is_scope(&self) -> bool {
        matches!(
            self,
            Provision::ClientScope | Provision::ServerScope | Provision::ServerHistoryScope
        )
    }
}

impl fmt::Display for Provision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provision::Table => "table",
            Provision::TrackingTable => "tracking_table",
            Provision::Triggers => "triggers",
            Provision::StoredProcedures => "stored_procedures",
            Provision::ClientScope => "client_scope",
            Provision::ServerScope => "server_scope",
            Provision::ServerHistoryScope => "server_history_scope",
        };
        f.write_str(s)
    }
}

/// A set of [`Provision`] kinds
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncProvision(BTreeSet<Provision>);

impl SyncProvision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provision: Provision) -> Self {
        self.0.insert(provision);
        self
    }

    /// What a client database needs to synchronize
    pub fn client_default() -> Self {
        [
            Provision::Table,
            Provision::TrackingTable,
            Provision::Triggers,
            Provision::StoredProcedures,
            Provision::ClientScope,
        ]
        .into_iter()
        .collect()
    }

    /// What a server database needs to synchronize, its tables already exist
    pub fn server_default() -> Self {
        [
            Provision::TrackingTable,
            Provision::Triggers,
            Provision::StoredProcedures,
            Provision::ServerScope,
            Provision::ServerHistoryScope,
        ]
        .into_iter()
        .collect()
    }

    /// Per table artifacts, the user table excluded
    pub fn table_artifacts() -> Self {
        [
            Provision::TrackingTable,
            Provision::Triggers,
            Provision::StoredProcedures,
        ]
        .into_iter()
        .collect()
    }

    pub fn contains(&self, provision: Provision) -> bool {
        self.0.contains(&provision)
    }

    pub fn union(&self, other: &SyncProvision) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &SyncProvision) -> Self {
        Self(self.0.difference(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &SyncProvision) -> Self {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Provision> + '_ {
        self.0.iter().copied()
    }

    pub fn has_table_artifacts(&self) -> bool {
        self.iter().any(|p| !p.is_scope())
    }
}

impl FromIterator<Provision> for SyncProvision {
    fn from_iter<I: IntoIterator<Item = Provision>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Provision> for SyncProvision {
    fn from(provision: Provision) -> Self {
        SyncProvision::new().with(provision)
    }
}

impl fmt::Display for SyncProvision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let client = SyncProvision::client_default();
        let server = SyncProvision::server_default();

        let shared = client.intersection(&server);
        assert_eq!(shared, SyncProvision::table_artifacts());

        let client_only = client.difference(&server);
        assert!(client_only.contains(Provision::Table));
        assert!(client_only.contains(Provision::ClientScope));
        assert!(!client_only.contains(Provision::TrackingTable));

        let all = client.union(&server);
        assert_eq!(all.iter().count(), 7);
    }

    #[test]
    fn test_display_and_table_artifacts() {
        let provision = SyncProvision::from(Provision::ClientScope).with(Provision::Triggers);
        assert_eq!(provision.to_string(), "triggers, client_scope");
        assert!(provision.has_table_artifacts());
        assert!(!SyncProvision::from(Provision::ServerScope).has_table_artifacts());
    }
}
