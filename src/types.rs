//! Core types shared by every tracksync component

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Which endpoint an orchestrator drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// Way rows travel when this side selects changes
    pub fn selecting_way(&self) -> SyncWay {
        match self {
            Side::Client => SyncWay::Upload,
            Side::Server => SyncWay::Download,
        }
    }

    /// Way rows travel when this side applies changes
    pub fn applying_way(&self) -> SyncWay {
        match self {
            Side::Client => SyncWay::Download,
            Side::Server => SyncWay::Upload,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// Direction rows are travelling in, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncWay {
    Upload,
    Download,
}

/// Per-table synchronization direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    DownloadOnly,
    UploadOnly,
    None,
}

impl SyncDirection {
    /// Whether rows of a table with this direction travel the given way
    pub fn allows(&self, way: SyncWay) -> bool {
        match (self, way) {
            (SyncDirection::Bidirectional, _) => true,
            (SyncDirection::DownloadOnly, SyncWay::Download) => true,
            (SyncDirection::UploadOnly, SyncWay::Upload) => true,
            _ => false,
        }
    }
}

/// Which side wins when the same row changed on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionPolicy {
    #[default]
    ServerWins,
    ClientWins,
}

impl ConflictResolutionPolicy {
    /// Whether the incoming row wins a conflict when applied on `side`
    pub fn incoming_wins(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (ConflictResolutionPolicy::ServerWins, Side::Client)
                | (ConflictResolutionPolicy::ClientWins, Side::Server)
        )
    }
}

/// Stage an orchestrator is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    #[default]
    None,
    ScopeLoading,
    SchemaReading,
    Provisioning,
    ChangesSelecting,
    ChangesApplying,
    MetadataCleaning,
    Deprovisioning,
    Migrating,
    BeginSession,
    EndSession,
    SnapshotCreating,
    SnapshotApplying,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStage::None => "idle",
            SyncStage::ScopeLoading => "loading scope",
            SyncStage::SchemaReading => "reading schema",
            SyncStage::Provisioning => "provisioning",
            SyncStage::ChangesSelecting => "selecting changes",
            SyncStage::ChangesApplying => "applying changes",
            SyncStage::MetadataCleaning => "cleaning metadata",
            SyncStage::Deprovisioning => "deprovisioning",
            SyncStage::Migrating => "migrating",
            SyncStage::BeginSession => "beginning session",
            SyncStage::EndSession => "ending session",
            SyncStage::SnapshotCreating => "creating snapshot",
            SyncStage::SnapshotApplying => "applying snapshot",
        };
        f.write_str(s)
    }
}

/// Kind of scope record kept in a scope table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Client,
    Server,
    ServerHistory,
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeType::Client => write!(f, "client"),
            ScopeType::Server => write!(f, "server"),
            ScopeType::ServerHistory => write!(f, "server_history"),
        }
    }
}

/// Named filter parameter values, kept sorted by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncParameters(BTreeMap<String, serde_json::Value>);

impl SyncParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, replacing any previous value with the same name
    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Case-insensitive lookup, parameter names are not case sensitive
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name).or_else(|| {
            self.0
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
