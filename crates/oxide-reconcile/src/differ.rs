//! Schema differ.
//!
//! This module compares declared descriptors with the live ones read by the
//! inspector and produces the ordered steps that bring the database in line
//! with the declarations.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::{MigrateError, Result};
use crate::fingerprint::Fingerprint;
use crate::schema::{ColumnDescriptor, TableDescriptor};
use crate::step::{ColumnMapping, MigrationStep};

/// Prefix of the scratch tables used by table rebuilds.
pub const TEMP_TABLE_PREFIX: &str = "_oxide_tmp_";

/// Produces migration plans.
#[derive(Debug, Clone)]
pub struct SchemaDiffer {
    run_token: String,
    reserved: BTreeSet<String>,
}

impl SchemaDiffer {
    /// Creates a differ whose scratch table names carry `run_token`.
    #[must_use]
    pub fn new(run_token: impl Into<String>) -> Self {
        Self {
            run_token: run_token.into(),
            reserved: BTreeSet::new(),
        }
    }

    /// Marks table names that scratch tables must not take.
    #[must_use]
    pub fn reserve<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved.extend(names.into_iter().map(Into::into));
        self
    }

    /// Plans the steps for a whole declared schema set.
    ///
    /// `stored` holds the fingerprints recorded by previous runs; a declared
    /// table whose fingerprint matches its record and which exists live is
    /// skipped without a structural comparison. Undeclared live tables are
    /// dropped only when `allow_drop` is set.
    pub fn plan(
        &mut self,
        declared: &[TableDescriptor],
        live: &BTreeMap<String, TableDescriptor>,
        stored: &HashMap<String, Fingerprint>,
        allow_drop: bool,
    ) -> Result<Vec<MigrationStep>> {
        check_references(declared)?;
        let ordered = dependency_order(declared)?;

        self.reserved.extend(live.keys().cloned());
        self.reserved.extend(declared.iter().map(|t| t.name.clone()));

        let declared_names: HashSet<&str> = declared.iter().map(|t| t.name.as_str()).collect();
        let undeclared: Vec<&TableDescriptor> = live
            .values()
            .filter(|t| !declared_names.contains(t.name.as_str()))
            .collect();

        let mut steps = Vec::new();
        if !undeclared.is_empty() {
            let names: Vec<String> = undeclared.iter().map(|t| t.name.clone()).collect();
            if !allow_drop {
                warn!(tables = ?names, "Refusing to drop undeclared tables");
                return Err(MigrateError::DestructiveDropRefused { tables: names });
            }
            steps.extend(drop_order(&undeclared).into_iter().map(MigrationStep::DropTable));
        }

        for table in ordered {
            let current = live.get(&table.name);
            if current.is_some() && stored.get(&table.name) == Some(&Fingerprint::of(table)) {
                debug!(table = %table.name, "Fingerprint unchanged, skipping");
                continue;
            }
            steps.extend(self.diff_table(table, current));
        }

        // Index names are global to the database: every index that goes away
        // must be gone before any index is created.
        steps.sort_by_key(phase_rank);
        Ok(steps)
    }

    /// Compares one declared table with its live counterpart.
    #[must_use]
    pub fn diff_table(
        &mut self,
        declared: &TableDescriptor,
        live: Option<&TableDescriptor>,
    ) -> Vec<MigrationStep> {
        let declared = declared.canonical();

        let Some(live) = live else {
            info!(table = %declared.name, "Creating table");
            let mut steps = Vec::with_capacity(declared.indices.len() + 1);
            let name = declared.name.clone();
            let indices = declared.indices.clone();
            steps.push(MigrationStep::CreateTable(declared));
            steps.extend(indices.into_iter().map(|index| MigrationStep::CreateIndex {
                table: name.clone(),
                index,
            }));
            return steps;
        };

        if Fingerprint::of(live) == Fingerprint::of(&declared) {
            return Vec::new();
        }
        let live = live.canonical();

        let (additions, rebuild) = diff_columns(&declared, &live);
        if let Some(reason) = rebuild {
            info!(table = %declared.name, reason = %reason, "Rebuilding table");
            return self.rebuild(declared, live);
        }

        let mut steps: Vec<MigrationStep> = additions
            .into_iter()
            .map(|column| MigrationStep::AddColumn {
                table: declared.name.clone(),
                column,
            })
            .collect();

        for index in &live.indices {
            if declared.get_index(&index.name) != Some(index) {
                steps.push(MigrationStep::DropIndex {
                    table: declared.name.clone(),
                    name: index.name.clone(),
                });
            }
        }
        for index in &declared.indices {
            if live.get_index(&index.name) != Some(index) {
                steps.push(MigrationStep::CreateIndex {
                    table: declared.name.clone(),
                    index: index.clone(),
                });
            }
        }

        if !steps.is_empty() {
            info!(table = %declared.name, steps = steps.len(), "Altering table");
        }
        steps
    }

    fn rebuild(&mut self, declared: TableDescriptor, live: TableDescriptor) -> Vec<MigrationStep> {
        let name = declared.name.clone();
        let indices = declared.indices.clone();
        let mut steps = vec![MigrationStep::RecreateTable {
            table: name.clone(),
            temp_table: self.temp_table_name(&name),
            mapping: ColumnMapping::between(&live, &declared),
            old: live,
            new: declared,
        }];
        // The rebuilt table starts without indices.
        steps.extend(indices.into_iter().map(|index| MigrationStep::CreateIndex {
            table: name.clone(),
            index,
        }));
        steps
    }

    fn temp_table_name(&mut self, table: &str) -> String {
        let base = format!("{TEMP_TABLE_PREFIX}{table}_{}", self.run_token);
        let mut name = base.clone();
        let mut n = 1;
        while self.reserved.contains(&name) {
            name = format!("{base}_{n}");
            n += 1;
        }
        self.reserved.insert(name.clone());
        name
    }
}

/// Splits declared columns into plain additions, or reports why the table
/// must be rebuilt instead.
fn diff_columns(
    declared: &TableDescriptor,
    live: &TableDescriptor,
) -> (Vec<ColumnDescriptor>, Option<String>) {
    let mut additions = Vec::new();

    for column in &declared.columns {
        match live.get_column(&column.name) {
            None if can_add_in_place(column) => additions.push(column.clone()),
            None => {
                let reason = format!("column '{}' cannot be appended", column.name);
                return (additions, Some(reason));
            }
            Some(existing) => {
                if let Some(change) = column_change(existing, column) {
                    return (
                        additions,
                        Some(format!("column '{}' changed {change}", column.name)),
                    );
                }
            }
        }
    }

    if let Some(removed) = live
        .columns
        .iter()
        .find(|c| declared.get_column(&c.name).is_none())
    {
        return (additions, Some(format!("column '{}' removed", removed.name)));
    }

    if live.foreign_keys != declared.foreign_keys {
        return (additions, Some("foreign keys changed".to_string()));
    }

    (additions, None)
}

/// Returns true for columns `ALTER TABLE ADD COLUMN` can append.
fn can_add_in_place(column: &ColumnDescriptor) -> bool {
    !column.primary_key
        && !column.auto_increment
        && column.default.is_constant()
        && column.can_be_omitted()
}

fn column_change(live: &ColumnDescriptor, declared: &ColumnDescriptor) -> Option<&'static str> {
    if live.sql_type != declared.sql_type {
        Some("type")
    } else if live.collation != declared.collation {
        Some("collation")
    } else if live.primary_key != declared.primary_key {
        Some("primary key")
    } else if live.nullable != declared.nullable {
        Some("nullability")
    } else if live.default.to_sql() != declared.default.to_sql() {
        Some("default")
    } else if live.auto_increment != declared.auto_increment {
        Some("auto-increment")
    } else {
        None
    }
}

fn check_references(declared: &[TableDescriptor]) -> Result<()> {
    let names: HashSet<&str> = declared.iter().map(|t| t.name.as_str()).collect();
    for table in declared {
        for fk in &table.foreign_keys {
            if !names.contains(fk.references_table.as_str()) {
                return Err(MigrateError::UnresolvedForeignKey {
                    table: table.name.clone(),
                    column: fk.column.clone(),
                    references: fk.references_table.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Orders tables so that every table follows the tables it references.
///
/// Ties keep declaration order. Self-references are ignored and references
/// to tables outside `tables` impose no order.
pub fn dependency_order(tables: &[TableDescriptor]) -> Result<Vec<&TableDescriptor>> {
    let refs: Vec<&TableDescriptor> = tables.iter().collect();
    topological(&refs).map_err(|tables| MigrateError::SchemaCycle { tables })
}

/// Kahn's algorithm over table indices; on a cycle, returns the sorted names
/// of the tables left unordered.
fn topological<'a>(
    tables: &[&'a TableDescriptor],
) -> std::result::Result<Vec<&'a TableDescriptor>, Vec<String>> {
    let position: HashMap<&str, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; tables.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tables.len()];
    for (i, table) in tables.iter().enumerate() {
        let referenced: BTreeSet<usize> = table
            .referenced_tables()
            .filter_map(|name| position.get(name).copied())
            .collect();
        for dep in referenced {
            in_degree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..tables.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(tables.len());
    while let Some(i) = ready.pop_first() {
        ordered.push(tables[i]);
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if ordered.len() != tables.len() {
        let mut stuck: Vec<String> = (0..tables.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| tables[i].name.clone())
            .collect();
        stuck.sort();
        return Err(stuck);
    }
    Ok(ordered)
}

/// Position of a step within the plan. The sort is stable, so dependency
/// order holds inside each rank.
const fn phase_rank(step: &MigrationStep) -> u8 {
    match step {
        MigrationStep::DropTable(_) => 0,
        MigrationStep::DropIndex { .. } => 1,
        MigrationStep::CreateTable(_)
        | MigrationStep::AddColumn { .. }
        | MigrationStep::RecreateTable { .. } => 2,
        MigrationStep::CreateIndex { .. } => 3,
    }
}

/// Orders undeclared tables for dropping: referencing tables first.
fn drop_order(tables: &[&TableDescriptor]) -> Vec<String> {
    match topological(tables) {
        Ok(ordered) => ordered.into_iter().rev().map(|t| t.name.clone()).collect(),
        Err(_) => {
            // Enforcement is off during the run, so any order works.
            let mut names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
            names.sort();
            names
        }
    }
}
