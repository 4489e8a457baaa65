//! Routing decisions derived from node records.

use meridian_protocol::TableSelection;

use crate::record::{NodeRecord, Replicates};

/// Whether this node should hold a replication connection to `node` for `database`.
///
/// True when the peer fully replicates, the database is hosted locally and
/// our own record is not explicitly `replicates: false`; or when one of the
/// peer's subscriptions names the database.
pub fn should_replicate_to_node(
    node: &NodeRecord,
    database: &str,
    local_databases: &[String],
    own_replicates: Option<Replicates>,
) -> bool {
    let full = match node.replicates {
        Some(Replicates::Full | Replicates::SendOnly) => {
            local_databases.iter().any(|d| d == database)
                && own_replicates != Some(Replicates::Disabled)
        }
        Some(Replicates::Disabled) | None => false,
    };
    full || node
        .subscriptions
        .iter()
        .any(|s| s.database == database && (s.publish || s.subscribe))
}

/// Tables to apply from `node` for `database`.
pub fn table_selection(node: &NodeRecord, database: &str) -> TableSelection {
    if node.replicates_fully() {
        return TableSelection::all();
    }
    let mut selection = TableSelection::default();
    for sub in node
        .subscriptions
        .iter()
        .filter(|s| s.database == database && s.subscribe)
    {
        match &sub.table {
            None => selection.replicate_by_default = true,
            Some(table) if !selection.tables.contains(table) => {
                selection.tables.push(table.clone())
            }
            Some(_) => {}
        }
    }
    selection
}

/// Earliest subscription start time configured for `database`, if any.
pub fn subscription_start_time(node: &NodeRecord, database: &str) -> Option<f64> {
    node.subscriptions
        .iter()
        .filter(|s| s.database == database)
        .filter_map(|s| s.start_time)
        .reduce(f64::min)
}
