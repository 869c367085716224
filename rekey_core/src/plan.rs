//! Declarative migration plans.
//!
//! A [`MigrationPlan`] lists the tables whose identity column is replaced and
//! the reference columns that must be translated alongside them. Plans are
//! validated once on construction and never change afterwards.
//!
//! ```rust
//! use rekey_core::plan::MigrationPlan;
//!
//! let plan = MigrationPlan::builder()
//!     .table("colors", "id")
//!     .table("products", "id")
//!     .reference("products", "color_id", "colors")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(plan.levels().len(), 2);
//! ```

use crate::error::PlanError;
use crate::value::{ColumnDef, ColumnType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Default suffix appended to an old column name to form its shadow name.
pub const DEFAULT_SHADOW_SUFFIX: &str = "_next";

/// The identity column of one table and how it is replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePlan {
    /// Table name.
    pub table: String,
    /// Current identity (primary key) column.
    pub identity_column: String,
    /// Name of the shadow column that takes its place.
    pub shadow_column: String,
    /// Type of the shadow column.
    #[serde(default = "default_shadow_type")]
    pub shadow_type: ColumnType,
    /// Column holding each row's creation time, used to seed identifiers so
    /// new keys sort in creation order.
    #[serde(default)]
    pub created_at_column: Option<String>,
}

impl TablePlan {
    /// The definition used when adding the shadow column.
    pub fn shadow_def(&self) -> ColumnDef {
        ColumnDef::new(&self.shadow_column, self.shadow_type.clone())
    }
}

/// A column holding foreign-key values into another planned table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceColumn {
    /// Table holding the reference.
    pub table: String,
    /// Current reference column.
    pub column: String,
    /// Shadow column receiving the translated reference.
    pub shadow_column: String,
    /// Table the reference points at. Its identity column is the target.
    pub references: String,
    /// Keep the swapped-in reference nullable even if the old column was
    /// NOT NULL. Otherwise the old column's NOT NULL constraint, if it had
    /// one, is put back after the swap.
    #[serde(default)]
    pub nullable: bool,
}

fn default_shadow_type() -> ColumnType {
    ColumnType::Uuid
}

/// A validated, immutable migration plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPlan", into = "RawPlan")]
pub struct MigrationPlan {
    tables: Vec<TablePlan>,
    references: Vec<ReferenceColumn>,
    levels: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPlan {
    tables: Vec<TablePlan>,
    #[serde(default)]
    references: Vec<ReferenceColumn>,
}

impl TryFrom<RawPlan> for MigrationPlan {
    type Error = PlanError;

    fn try_from(raw: RawPlan) -> Result<Self, Self::Error> {
        MigrationPlan::new(raw.tables, raw.references)
    }
}

impl From<MigrationPlan> for RawPlan {
    fn from(plan: MigrationPlan) -> Self {
        RawPlan {
            tables: plan.tables,
            references: plan.references,
        }
    }
}

impl MigrationPlan {
    /// Validates and builds a plan.
    pub fn new(
        tables: Vec<TablePlan>,
        references: Vec<ReferenceColumn>,
    ) -> Result<Self, PlanError> {
        validate(&tables, &references)?;
        let levels = topological_levels(&tables, &references)?;
        Ok(Self {
            tables,
            references,
            levels,
        })
    }

    /// Starts a builder.
    pub fn builder() -> MigrationPlanBuilder {
        MigrationPlanBuilder::default()
    }

    /// Parses a plan from its JSON configuration form.
    ///
    /// ```json
    /// {
    ///   "tables": [
    ///     { "table": "colors", "identity_column": "id", "shadow_column": "id_next" }
    ///   ],
    ///   "references": []
    /// }
    /// ```
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Planned tables, in declaration order.
    pub fn tables(&self) -> &[TablePlan] {
        &self.tables
    }

    /// Planned reference columns, in declaration order.
    pub fn references(&self) -> &[ReferenceColumn] {
        &self.references
    }

    /// Looks a table plan up by table name.
    pub fn table(&self, name: &str) -> Option<&TablePlan> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Reference columns held by `table`.
    pub fn references_from<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a ReferenceColumn> + 'a {
        self.references.iter().filter(move |r| r.table == table)
    }

    /// Tables grouped by dependency depth. Every table a level references
    /// lives in an earlier level (or is the table itself).
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Tables in an order where referenced tables precede referencing ones.
    pub fn topological_order(&self) -> impl Iterator<Item = &TablePlan> {
        self.levels
            .iter()
            .flatten()
            .filter_map(|name| self.table(name))
    }
}

fn validate(tables: &[TablePlan], references: &[ReferenceColumn]) -> Result<(), PlanError> {
    if tables.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut names = HashSet::new();
    for table in tables {
        if table.table.is_empty() {
            return Err(PlanError::EmptyName("table"));
        }
        if table.identity_column.is_empty() || table.shadow_column.is_empty() {
            return Err(PlanError::EmptyName("column"));
        }
        if !names.insert(table.table.as_str()) {
            return Err(PlanError::DuplicateTable(table.table.clone()));
        }
        if table.shadow_type != ColumnType::Uuid {
            return Err(PlanError::UnsupportedShadowType {
                table: table.table.clone(),
                column: table.shadow_column.clone(),
                found: table.shadow_type.to_string(),
            });
        }
    }

    // Every old and shadow column name in a table must be distinct, otherwise
    // a rename would land on a column that is still in use.
    let mut columns: BTreeMap<&str, HashSet<&str>> = BTreeMap::new();
    for table in tables {
        let set = columns.entry(table.table.as_str()).or_default();
        set.insert(table.identity_column.as_str());
        if !set.insert(table.shadow_column.as_str()) {
            return Err(PlanError::ShadowCollision {
                table: table.table.clone(),
                column: table.shadow_column.clone(),
            });
        }
    }

    let mut seen_refs = HashSet::new();
    for reference in references {
        if reference.column.is_empty() || reference.shadow_column.is_empty() {
            return Err(PlanError::EmptyName("column"));
        }
        if !seen_refs.insert((reference.table.as_str(), reference.column.as_str())) {
            return Err(PlanError::DuplicateReference {
                table: reference.table.clone(),
                column: reference.column.clone(),
            });
        }
        if !names.contains(reference.references.as_str()) {
            return Err(PlanError::UnknownReferencedTable {
                table: reference.table.clone(),
                column: reference.column.clone(),
                referenced: reference.references.clone(),
            });
        }
        let Some(set) = columns.get_mut(reference.table.as_str()) else {
            return Err(PlanError::UnknownReferencingTable {
                table: reference.table.clone(),
                column: reference.column.clone(),
            });
        };
        if !set.insert(reference.column.as_str()) {
            return Err(PlanError::ShadowCollision {
                table: reference.table.clone(),
                column: reference.column.clone(),
            });
        }
        if !set.insert(reference.shadow_column.as_str()) {
            return Err(PlanError::ShadowCollision {
                table: reference.table.clone(),
                column: reference.shadow_column.clone(),
            });
        }
    }

    Ok(())
}

/// Groups tables into dependency levels (Kahn's algorithm). Self references
/// are allowed since a table's identity is always backfilled before its own
/// reference columns.
fn topological_levels(
    tables: &[TablePlan],
    references: &[ReferenceColumn],
) -> Result<Vec<Vec<String>>, PlanError> {
    let mut depends_on: BTreeMap<&str, BTreeSet<&str>> = tables
        .iter()
        .map(|t| (t.table.as_str(), BTreeSet::new()))
        .collect();
    for reference in references {
        if reference.table != reference.references
            && let Some(deps) = depends_on.get_mut(reference.table.as_str())
        {
            deps.insert(reference.references.as_str());
        }
    }

    let mut placed: HashSet<&str> = HashSet::new();
    let mut levels = Vec::new();
    while placed.len() < tables.len() {
        // Keep declaration order within a level.
        let level: Vec<String> = tables
            .iter()
            .map(|t| t.table.as_str())
            .filter(|name| !placed.contains(name))
            .filter(|name| depends_on[name].iter().all(|dep| placed.contains(dep)))
            .map(str::to_string)
            .collect();

        if level.is_empty() {
            let stuck = tables
                .iter()
                .map(|t| t.table.as_str())
                .find(|name| !placed.contains(name))
                .unwrap_or_default();
            return Err(PlanError::CyclicReferences(stuck.to_string()));
        }
        for name in &level {
            if let Some(table) = tables.iter().find(|t| &t.table == name) {
                placed.insert(table.table.as_str());
            }
        }
        levels.push(level);
    }
    Ok(levels)
}

/// Incremental builder for [`MigrationPlan`].
#[derive(Debug, Default)]
pub struct MigrationPlanBuilder {
    tables: Vec<TablePlan>,
    references: Vec<ReferenceColumn>,
}

impl MigrationPlanBuilder {
    /// Adds a table whose `identity_column` becomes a UUID, using the
    /// default shadow name and no creation timestamp.
    pub fn table(mut self, table: &str, identity_column: &str) -> Self {
        self.tables.push(TablePlan {
            table: table.to_string(),
            identity_column: identity_column.to_string(),
            shadow_column: format!("{}{}", identity_column, DEFAULT_SHADOW_SUFFIX),
            shadow_type: ColumnType::Uuid,
            created_at_column: None,
        });
        self
    }

    /// Adds a table whose new identifiers are seeded from `created_at_column`.
    pub fn table_seeded(
        mut self,
        table: &str,
        identity_column: &str,
        created_at_column: &str,
    ) -> Self {
        self = self.table(table, identity_column);
        if let Some(last) = self.tables.last_mut() {
            last.created_at_column = Some(created_at_column.to_string());
        }
        self
    }

    /// Adds a fully specified table plan.
    pub fn table_plan(mut self, plan: TablePlan) -> Self {
        self.tables.push(plan);
        self
    }

    /// Adds a reference from `table.column` to `references`. The new column
    /// is NOT NULL exactly when the old one was.
    pub fn reference(mut self, table: &str, column: &str, references: &str) -> Self {
        self.references.push(ReferenceColumn {
            table: table.to_string(),
            column: column.to_string(),
            shadow_column: format!("{}{}", column, DEFAULT_SHADOW_SUFFIX),
            references: references.to_string(),
            nullable: false,
        });
        self
    }

    /// Adds a reference from `table.column` to `references` that stays
    /// nullable after the swap.
    pub fn nullable_reference(mut self, table: &str, column: &str, references: &str) -> Self {
        self = self.reference(table, column, references);
        if let Some(last) = self.references.last_mut() {
            last.nullable = true;
        }
        self
    }

    /// Adds a fully specified reference column.
    pub fn reference_column(mut self, reference: ReferenceColumn) -> Self {
        self.references.push(reference);
        self
    }

    /// Validates and builds the plan.
    pub fn build(self) -> Result<MigrationPlan, PlanError> {
        MigrationPlan::new(self.tables, self.references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referenced_tables_come_first() {
        let plan = MigrationPlan::builder()
            .table("products", "id")
            .table("colors", "id")
            .table("sizes", "id")
            .reference("products", "color_id", "colors")
            .reference("products", "size_id", "sizes")
            .build()
            .unwrap();

        assert_eq!(
            plan.levels(),
            &[
                vec!["colors".to_string(), "sizes".to_string()],
                vec!["products".to_string()]
            ]
        );
        let order: Vec<&str> = plan.topological_order().map(|t| t.table.as_str()).collect();
        assert_eq!(order, vec!["colors", "sizes", "products"]);
    }

    #[test]
    fn self_references_do_not_form_a_cycle() {
        let plan = MigrationPlan::builder()
            .table("employees", "id")
            .nullable_reference("employees", "manager_id", "employees")
            .build()
            .unwrap();
        assert_eq!(plan.levels().len(), 1);
    }

    #[test]
    fn cycles_between_tables_are_rejected() {
        let err = MigrationPlan::builder()
            .table("a", "id")
            .table("b", "id")
            .reference("a", "b_id", "b")
            .reference("b", "a_id", "a")
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::CyclicReferences(_)));
    }

    #[test]
    fn references_must_target_planned_tables() {
        let err = MigrationPlan::builder()
            .table("products", "id")
            .reference("products", "color_id", "colors")
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownReferencedTable { .. }));
    }

    #[test]
    fn shadow_cannot_reuse_the_old_name() {
        let err = MigrationPlan::builder()
            .table_plan(TablePlan {
                table: "colors".into(),
                identity_column: "id".into(),
                shadow_column: "id".into(),
                shadow_type: ColumnType::Uuid,
                created_at_column: None,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::ShadowCollision { .. }));
    }

    #[test]
    fn duplicate_tables_are_rejected() {
        let err = MigrationPlan::builder()
            .table("colors", "id")
            .table("colors", "id")
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateTable(name) if name == "colors"));
    }

    #[test]
    fn empty_plans_are_rejected() {
        assert!(matches!(
            MigrationPlan::builder().build(),
            Err(PlanError::Empty)
        ));
    }

    #[test]
    fn plan_loads_from_json() {
        let plan = MigrationPlan::from_json(
            r#"{
                "tables": [
                    { "table": "colors", "identity_column": "id", "shadow_column": "uuid_id" },
                    { "table": "products", "identity_column": "id", "shadow_column": "uuid_id",
                      "created_at_column": "created_at" }
                ],
                "references": [
                    { "table": "products", "column": "color_id", "shadow_column": "color_uuid",
                      "references": "colors" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(plan.tables().len(), 2);
        assert_eq!(plan.tables()[0].shadow_type, ColumnType::Uuid);
        assert_eq!(
            plan.table("products").unwrap().created_at_column.as_deref(),
            Some("created_at")
        );
        assert!(!plan.references()[0].nullable);
    }

    #[test]
    fn invalid_json_plans_fail_validation() {
        let err = MigrationPlan::from_json(
            r#"{ "tables": [
                { "table": "a", "identity_column": "id", "shadow_column": "next", "shadow_type": "text" }
            ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::Json(_)));
    }
}
