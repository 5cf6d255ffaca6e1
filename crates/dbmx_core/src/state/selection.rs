//! Read-only projection of the focused tab and the live databases.

use super::{ConnectionRegistry, DatabaseCatalog, TabManager};
use crate::models::DatabaseId;

/// What the selection bar and status line show.
///
/// Derived from the registry, catalog and tabs after every mutation; there
/// is no way to set it directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionView {
    /// Label of the active tab's database, or the placeholder
    pub selected_database_label: String,
    /// Accent color of the active tab's database, or empty
    pub current_color: String,
    /// Pool of the active tab's database, or empty
    pub active_pool_id: String,
    /// Databases of every active connection, by connection id then backend order
    pub active_databases: Vec<DatabaseId>,
}

impl SelectionView {
    /// Compute the projection.
    pub fn compute(
        registry: &ConnectionRegistry,
        catalog: &DatabaseCatalog,
        tabs: &TabManager,
        placeholder: &str,
    ) -> Self {
        let database = tabs
            .active()
            .and_then(|tab| tab.active_database_id.as_ref())
            .and_then(|id| catalog.get(id));

        let active_databases = registry
            .active_ids()
            .into_iter()
            .flat_map(|connection_id| catalog.databases_for(connection_id))
            .map(|database| database.id.clone())
            .collect();

        match database {
            Some(database) => Self {
                selected_database_label: database.label(),
                current_color: database.color.clone(),
                active_pool_id: database.pool_id.clone(),
                active_databases,
            },
            None => Self {
                selected_database_label: placeholder.to_string(),
                active_databases,
                ..Default::default()
            },
        }
    }
}
