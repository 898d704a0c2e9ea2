//! Scope version upgrades
//!
//! The chain of milestones is declared once in [`UPGRADE_CHAIN`]. An upgrade
//! walks it one step at a time from the recorded version, every step either
//! recreating some artifacts or only bumping the version.

mod engine;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::provider::ProcedureKind;

/// Semantic version of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SyncVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for SyncVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SyncVersion {
    type Err = SyncError;

    /// Accepts `major.minor` and `major.minor.patch`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || SyncError::InvalidVersion(s.to_string());
        let parts: Vec<&str> = s.trim().split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid());
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

/// Version written by this crate
pub const CURRENT_VERSION: SyncVersion = SyncVersion::new(0, 9, 1);

/// Oldest version an upgrade can start from
pub const FIRST_SUPPORTED_VERSION: SyncVersion = SyncVersion::new(0, 5, 7);

const SELECT_PROCEDURES: &[ProcedureKind] = &[
    ProcedureKind::SelectChanges,
    ProcedureKind::SelectChangesWithFilters,
    ProcedureKind::SelectInitializedChanges,
    ProcedureKind::SelectInitializedChangesWithFilters,
];

const WRITE_PROCEDURES: &[ProcedureKind] = &[
    ProcedureKind::UpdateRow,
    ProcedureKind::DeleteRow,
    ProcedureKind::BulkTableType,
    ProcedureKind::BulkUpdateRows,
    ProcedureKind::BulkDeleteRows,
];

/// Work done by one upgrade step on every table of the scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeAction {
    /// Version bump only
    Bump,
    RecreateProcedures(&'static [ProcedureKind]),
    RecreateTriggers,
    RecreateTriggersAndProcedures(&'static [ProcedureKind]),
    /// Triggers and every stored procedure
    RecreateAll,
}

impl UpgradeAction {
    pub fn recreates_triggers(&self) -> bool {
        matches!(
            self,
            UpgradeAction::RecreateTriggers
                | UpgradeAction::RecreateTriggersAndProcedures(_)
                | UpgradeAction::RecreateAll
        )
    }

    pub fn procedures(&self) -> &'static [ProcedureKind] {
        match *self {
            UpgradeAction::RecreateProcedures(kinds)
            | UpgradeAction::RecreateTriggersAndProcedures(kinds) => kinds,
            UpgradeAction::RecreateAll => &ProcedureKind::ALL,
            UpgradeAction::Bump | UpgradeAction::RecreateTriggers => &[],
        }
    }
}

/// One milestone of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeStep {
    pub from: SyncVersion,
    pub to: SyncVersion,
    pub action: UpgradeAction,
}

const fn step(from: SyncVersion, to: SyncVersion, action: UpgradeAction) -> UpgradeStep {
    UpgradeStep { from, to, action }
}

pub const UPGRADE_CHAIN: &[UpgradeStep] = &[
    step(SyncVersion::new(0, 5, 7), SyncVersion::new(0, 6, 0), UpgradeAction::Bump),
    step(
        SyncVersion::new(0, 6, 0),
        SyncVersion::new(0, 6, 1),
        UpgradeAction::RecreateProcedures(SELECT_PROCEDURES),
    ),
    step(SyncVersion::new(0, 6, 1), SyncVersion::new(0, 6, 2), UpgradeAction::RecreateTriggers),
    step(SyncVersion::new(0, 6, 2), SyncVersion::new(0, 7, 0), UpgradeAction::Bump),
    step(
        SyncVersion::new(0, 7, 0),
        SyncVersion::new(0, 7, 1),
        UpgradeAction::RecreateProcedures(WRITE_PROCEDURES),
    ),
    step(SyncVersion::new(0, 7, 1), SyncVersion::new(0, 7, 2), UpgradeAction::Bump),
    step(
        SyncVersion::new(0, 7, 2),
        SyncVersion::new(0, 7, 3),
        UpgradeAction::RecreateProcedures(&[ProcedureKind::SelectRow]),
    ),
    step(
        SyncVersion::new(0, 7, 3),
        SyncVersion::new(0, 8, 0),
        UpgradeAction::RecreateTriggersAndProcedures(&[ProcedureKind::Reset]),
    ),
    step(SyncVersion::new(0, 8, 0), SyncVersion::new(0, 8, 1), UpgradeAction::Bump),
    step(SyncVersion::new(0, 8, 1), SyncVersion::new(0, 9, 0), UpgradeAction::RecreateAll),
    step(SyncVersion::new(0, 9, 0), SyncVersion::new(0, 9, 1), UpgradeAction::Bump),
];

/// Parse a recorded scope version
pub fn parse_version(version: &str) -> Result<SyncVersion> {
    version.parse()
}

pub fn needs_upgrade(version: SyncVersion) -> bool {
    version < CURRENT_VERSION
}

/// The step leading away from `version`, `None` once nothing is left
pub fn next_step(version: SyncVersion) -> Result<Option<&'static UpgradeStep>> {
    if version < FIRST_SUPPORTED_VERSION {
        return Err(SyncError::Config(format!(
            "scope version {} is older than {}, the oldest version that can be upgraded",
            version, FIRST_SUPPORTED_VERSION
        )));
    }
    Ok(UPGRADE_CHAIN.iter().find(|step| step.to > version))
}

/// Every step from `version` to the current version, in order
pub fn upgrade_path(version: SyncVersion) -> Result<Vec<&'static UpgradeStep>> {
    let mut path = Vec::new();
    let mut current = version;
    while let Some(step) = next_step(current)? {
        path.push(step);
        current = step.to;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!("0.9.1".parse::<SyncVersion>().unwrap(), SyncVersion::new(0, 9, 1));
        assert_eq!("1.2".parse::<SyncVersion>().unwrap(), SyncVersion::new(1, 2, 0));
        assert!(matches!(
            "banana".parse::<SyncVersion>(),
            Err(SyncError::InvalidVersion(_))
        ));
        assert!("1".parse::<SyncVersion>().is_err());
        assert!("1.2.3.4".parse::<SyncVersion>().is_err());
        assert!("1.x.3".parse::<SyncVersion>().is_err());
    }

    #[test]
    fn test_chain_is_contiguous_and_ends_at_current() {
        for pair in UPGRADE_CHAIN.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
            assert!(pair[0].from < pair[0].to);
        }
        assert_eq!(UPGRADE_CHAIN[0].from, FIRST_SUPPORTED_VERSION);
        assert_eq!(UPGRADE_CHAIN.last().map(|s| s.to), Some(CURRENT_VERSION));
    }

    #[test]
    fn test_upgrade_path_from_0_6_0() {
        let path = upgrade_path(SyncVersion::new(0, 6, 0)).unwrap();
        assert_eq!(path.len(), 10);
        assert_eq!(path[0].to, SyncVersion::new(0, 6, 1));
        assert_eq!(path.last().map(|s| s.to), Some(CURRENT_VERSION));
    }

    #[test]
    fn test_between_milestones_jumps_to_next() {
        let step = next_step(SyncVersion::new(0, 6, 5)).unwrap().unwrap();
        assert_eq!(step.to, SyncVersion::new(0, 7, 0));
    }

    #[test]
    fn test_current_and_newer_need_nothing() {
        assert!(!needs_upgrade(CURRENT_VERSION));
        assert!(next_step(CURRENT_VERSION).unwrap().is_none());
        assert!(upgrade_path(SyncVersion::new(1, 0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_too_old_is_a_configuration_error() {
        let err = next_step(SyncVersion::new(0, 5, 0)).unwrap_err();
        assert!(err.is_configuration());
    }
}
