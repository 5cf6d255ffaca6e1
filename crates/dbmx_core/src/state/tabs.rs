//! Ordered tab collection with a single active tab.

use super::tracker::LoadStatus;
use crate::error::{DbmxError, DbmxResult};
use crate::models::query::COLUMN_NAME_COLUMN;
use crate::models::{
    Database, DatabaseId, QueryOutput, QueryResult, Tab, TabId, TabKind, TableInfo,
};

/// Ordered tabs; at most one is active.
#[derive(Debug)]
pub struct TabManager {
    tabs: Vec<Tab>,
    last_id: i64,
}

impl Default for TabManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TabManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self { tabs: Vec::new(), last_id: 0 }
    }

    /// Append a new tab, bound to `database` if given, and make it active.
    pub fn open(&mut self, name: impl Into<String>, kind: TabKind, database: Option<&Database>) -> TabId {
        self.last_id += 1;
        let id = TabId(self.last_id);

        let mut tab = Tab::new(id, name, kind);
        if let Some(database) = database {
            tab.bind(database);
        }
        tab.is_active = true;

        for other in &mut self.tabs {
            other.is_active = false;
        }
        self.tabs.push(tab);
        id
    }

    /// Remove a tab.
    ///
    /// If it was active, its left neighbor becomes active, else its right
    /// neighbor, else none. Returns the active tab afterwards.
    pub fn close(&mut self, id: TabId) -> DbmxResult<Option<TabId>> {
        let index = self.index_of(id)?;
        let closed = self.tabs.remove(index);

        if closed.is_active && !self.tabs.is_empty() {
            let next = index.saturating_sub(1).min(self.tabs.len() - 1);
            self.tabs[next].is_active = true;
        }
        Ok(self.active_id())
    }

    /// Make `id` the only active tab. Returns true if focus moved.
    pub fn set_active(&mut self, id: TabId) -> DbmxResult<bool> {
        self.index_of(id)?;
        if self.active_id() == Some(id) {
            return Ok(false);
        }
        for tab in &mut self.tabs {
            tab.is_active = tab.id == id;
        }
        Ok(true)
    }

    /// Rename a tab.
    pub fn rename(&mut self, id: TabId, name: &str) -> DbmxResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DbmxError::invalid_input("Tab name cannot be empty"));
        }
        self.get_mut(id)?.name = name.to_string();
        Ok(())
    }

    /// Get a tab.
    pub fn get(&self, id: TabId) -> Option<&Tab> {
        self.tabs.iter().find(|tab| tab.id == id)
    }

    /// Get a tab mutably.
    pub fn get_mut(&mut self, id: TabId) -> DbmxResult<&mut Tab> {
        self.tabs
            .iter_mut()
            .find(|tab| tab.id == id)
            .ok_or_else(|| DbmxError::not_found("Tab", id))
    }

    /// The active tab.
    pub fn active(&self) -> Option<&Tab> {
        self.tabs.iter().find(|tab| tab.is_active)
    }

    /// Id of the active tab.
    pub fn active_id(&self) -> Option<TabId> {
        self.active().map(|tab| tab.id)
    }

    /// All tabs in display order.
    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    /// Number of tabs.
    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    /// Check if there are no tabs.
    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    /// Clear references to any of `removed`. Returns the affected tabs.
    pub fn clear_database_refs(&mut self, removed: &[DatabaseId]) -> Vec<TabId> {
        let mut affected = Vec::new();
        for tab in &mut self.tabs {
            if tab.active_database_id.as_ref().is_some_and(|id| removed.contains(id)) {
                tab.unbind();
                affected.push(tab.id);
            }
        }
        affected
    }

    /// Bind freshly loaded `database` to tabs with no database that either
    /// target it or are query tabs with no target. Returns the affected tabs.
    pub fn bind_loaded(&mut self, database: &Database) -> Vec<TabId> {
        let mut affected = Vec::new();
        for tab in &mut self.tabs {
            let wants = tab.active_database_id.is_none()
                && match tab.kind {
                    TabKind::Query => tab.bound_database_name.is_none() || tab.targets(database),
                    TabKind::Table => tab.targets(database),
                };
            if wants {
                tab.bind(database);
                affected.push(tab.id);
            }
        }
        affected
    }

    /// Append tabs loaded from storage, skipping ids already open.
    ///
    /// Later ids are allocated above the highest restored one. Restored tabs
    /// come back inactive when a tab already has focus; otherwise the first
    /// one saved as active gets it, else the last one restored. Returns the
    /// restored ids.
    pub fn restore(&mut self, saved: Vec<Tab>) -> Vec<TabId> {
        let had_focus = self.active_id().is_some();
        let mut restored = Vec::new();
        let mut focus = None;

        for mut tab in saved {
            if self.get(tab.id).is_some() {
                continue;
            }
            self.last_id = self.last_id.max(tab.id.0);
            if tab.is_active && focus.is_none() {
                focus = Some(tab.id);
            }
            tab.is_active = false;
            restored.push(tab.id);
            self.tabs.push(tab);
        }

        if !had_focus {
            if let Some(id) = focus.or_else(|| restored.last().copied()) {
                for tab in &mut self.tabs {
                    tab.is_active = tab.id == id;
                }
            }
        }
        restored
    }

    /// Refresh the label and color of tabs bound to `database`.
    pub fn relabel(&mut self, database: &Database) -> Vec<TabId> {
        let mut affected = Vec::new();
        for tab in &mut self.tabs {
            if tab.active_database_id.as_ref() == Some(&database.id) {
                tab.bind(database);
                affected.push(tab.id);
            }
        }
        affected
    }

    /// Start a run on a tab: bump its generation and mark it pending.
    /// Returns the new generation.
    pub fn begin_run(&mut self, id: TabId) -> DbmxResult<u64> {
        let tab = self.get_mut(id)?;
        tab.generation += 1;
        tab.query_status = LoadStatus::Pending;
        Ok(tab.generation)
    }

    /// Apply a query result if the tab still exists at `generation`.
    ///
    /// Returns false, touching nothing, if the result is stale.
    pub fn apply_result(&mut self, id: TabId, generation: u64, result: &QueryResult) -> bool {
        let Some(tab) = self.current_mut(id, generation) else {
            return false;
        };

        if result.ok {
            let output = QueryOutput { columns: result.columns.clone(), rows: result.rows.clone() };
            tab.output_text = serde_json::to_string(&output).unwrap_or_default();
            tab.last_columns = output.columns;
            tab.last_rows = output.rows;
            tab.last_error = None;
            tab.query_status = LoadStatus::Succeeded;
        } else {
            tab.output_text = result.message.clone();
            tab.last_columns.clear();
            tab.last_rows.clear();
            tab.last_error = Some(result.message.clone());
            tab.query_status = LoadStatus::Failed(DbmxError::query(
                result.message.clone(),
                None,
                None,
                None,
            ));
        }
        true
    }

    /// Start a table details load. Returns the new info generation.
    pub fn begin_info_load(&mut self, id: TabId) -> DbmxResult<u64> {
        let tab = self.get_mut(id)?;
        tab.info_generation += 1;
        Ok(tab.info_generation)
    }

    /// Apply loaded table details if the tab still exists at `generation`.
    pub fn apply_table_info(&mut self, id: TabId, generation: u64, info: &DbmxResult<TableInfo>) -> bool {
        let Some(tab) = self
            .tabs
            .iter_mut()
            .find(|tab| tab.id == id && tab.info_generation == generation)
        else {
            return false;
        };

        match info {
            Ok(info) => {
                tab.table_columns_list = info.structure.distinct_values(COLUMN_NAME_COLUMN);
                tab.table_info = Some(info.clone());
            }
            Err(err) => tab.last_error = Some(err.to_string()),
        }
        true
    }

    /// Return a tab to idle if its run at `generation` was abandoned.
    pub fn abandon_run(&mut self, id: TabId, generation: u64) -> bool {
        match self.current_mut(id, generation) {
            Some(tab) if tab.query_status.is_pending() => {
                tab.query_status = LoadStatus::Idle;
                true
            }
            _ => false,
        }
    }

    /// Number of active tabs. Always 0 or 1.
    pub fn active_count(&self) -> usize {
        self.tabs.iter().filter(|tab| tab.is_active).count()
    }

    fn current_mut(&mut self, id: TabId, generation: u64) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|tab| tab.id == id && tab.generation == generation)
    }

    fn index_of(&self, id: TabId) -> DbmxResult<usize> {
        self.tabs
            .iter()
            .position(|tab| tab.id == id)
            .ok_or_else(|| DbmxError::not_found("Tab", id))
    }
}
