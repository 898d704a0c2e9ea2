//! Snapshot directory naming
//!
//! `<snapshots_directory>/<scope>/<name_value pairs | ALL>`, where every
//! component keeps only alphanumeric characters and pairs are sorted by
//! parameter name.

use std::path::{Path, PathBuf};

use crate::types::SyncParameters;

fn alphanumeric(value: &str) -> String {
    value.chars().filter(|c| c.is_alphanumeric()).collect()
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn scope_directory_name(scope_name: &str) -> String {
    alphanumeric(scope_name)
}

pub fn parameters_directory_name(parameters: &SyncParameters) -> String {
    if parameters.is_empty() {
        return "ALL".to_string();
    }
    parameters
        .iter()
        .map(|(name, value)| format!("{}_{}", alphanumeric(name), alphanumeric(&value_text(value))))
        .collect::<Vec<_>>()
        .join("_")
}

pub fn snapshot_directory(root: &Path, scope_name: &str, parameters: &SyncParameters) -> PathBuf {
    root.join(scope_directory_name(scope_name))
        .join(parameters_directory_name(parameters))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_parameters_is_all() {
        let dir = snapshot_directory(Path::new("/snapshots"), "Default Scope!", &SyncParameters::new());
        assert_eq!(dir, PathBuf::from("/snapshots/DefaultScope/ALL"));
    }

    #[test]
    fn test_parameters_sorted_by_name() {
        let params = SyncParameters::new()
            .with("Region", "EU-West")
            .with("CustomerId", 42);
        assert_eq!(parameters_directory_name(&params), "CustomerId_42_Region_EUWest");
    }
}
