//! Session state components.
//!
//! - `registry` - ConnectionRegistry with its connect tracker
//! - `catalog` - DatabaseCatalog with list and schema trackers
//! - `tabs` - TabManager
//! - `selection` - SelectionView projection
//! - `tracker` - LoadStatus and LoadTracker
//! - `inflight` - per-key deduplication of in-flight loads
//!
//! Each component is a plain struct; the coordinator owns them behind locks
//! and always acquires them in the order registry, catalog, tabs.

pub mod catalog;
pub mod inflight;
pub mod registry;
pub mod selection;
pub mod tabs;
pub mod tracker;

pub use catalog::DatabaseCatalog;
pub use inflight::InFlight;
pub use registry::ConnectionRegistry;
pub use selection::SelectionView;
pub use tabs::TabManager;
pub use tracker::{LoadStatus, LoadTracker, PendingGuard};

use crate::error::DbmxError;
use crate::models::{ConnectionId, DatabaseId, TabId};

/// Outcome of a consistency repair pass.
#[derive(Debug, Default)]
pub struct Repair {
    /// Violations found, each already fixed
    pub violations: Vec<DbmxError>,
    /// Connections whose databases were dropped
    pub connections: Vec<ConnectionId>,
    /// Tabs whose references were cleared or whose focus changed
    pub tabs: Vec<TabId>,
}

impl Repair {
    /// Check if nothing had to be fixed.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Find and fix dangling references between the components.
///
/// Databases whose connection is gone are dropped, tab references to
/// missing databases are cleared and extra active tabs are demoted.
pub fn repair(
    registry: &ConnectionRegistry,
    catalog: &mut DatabaseCatalog,
    tabs: &mut TabManager,
) -> Repair {
    let mut report = Repair::default();

    let orphaned: Vec<ConnectionId> = {
        let mut ids: Vec<ConnectionId> = catalog
            .iter()
            .map(|database| database.connection_id)
            .filter(|id| !registry.contains(*id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    };
    for connection_id in orphaned {
        catalog.remove_connection(connection_id);
        report.violations.push(DbmxError::consistency_violation(format!(
            "databases of missing connection {connection_id}"
        )));
        report.connections.push(connection_id);
    }

    let dangling: Vec<DatabaseId> = tabs
        .tabs()
        .iter()
        .filter_map(|tab| tab.active_database_id.clone())
        .filter(|id| !catalog.contains(id))
        .collect();
    if !dangling.is_empty() {
        let affected = tabs.clear_database_refs(&dangling);
        report.violations.push(DbmxError::consistency_violation(format!(
            "{} tab(s) referenced missing databases",
            affected.len()
        )));
        report.tabs.extend(affected);
    }

    if tabs.active_count() > 1 {
        if let Some(keep) = tabs.active_id() {
            let demoted: Vec<TabId> = tabs
                .tabs()
                .iter()
                .filter(|tab| tab.is_active && tab.id != keep)
                .map(|tab| tab.id)
                .collect();
            for id in &demoted {
                if let Ok(tab) = tabs.get_mut(*id) {
                    tab.is_active = false;
                }
            }
            report.violations.push(DbmxError::consistency_violation(format!(
                "{} extra active tab(s)",
                demoted.len()
            )));
            report.tabs.extend(demoted);
        }
    }

    report
}
