// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Requested access scope and grant planning.
//!
//! A [`PermissionSet`] is the scope an operator approved, shaped as
//!
//! ```text
//! database -> table -> verb -> allowed
//! ```
//!
//! Only verbs in [`ALLOWED_VERBS`] ever leave this module. Unknown verbs and
//! verbs mapped to `false` are dropped silently, they are not an error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::ALLOWED_VERBS;

type TablePermissions = BTreeMap<String, BTreeMap<String, bool>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeMap<String, TablePermissions>);

/// Verbs to grant on a single table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableGrant {
    pub table: String,
    /// Always a non-empty subset of [`ALLOWED_VERBS`], in allow-list order.
    pub verbs: Vec<&'static str>,
}

/// Grants that share one administrative connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseGrants {
    pub database: String,
    pub tables: Vec<TableGrant>,
}

pub fn is_allowed_verb(verb: &str) -> bool {
    ALLOWED_VERBS.contains(&verb)
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `verb` on `database.table`, creating the intermediate maps.
    pub fn with(mut self, database: &str, table: &str, verb: &str, allowed: bool) -> Self {
        self.0
            .entry(database.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .insert(verb.to_string(), allowed);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn database_count(&self) -> usize {
        self.0.len()
    }

    pub fn table_count(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    /// Translates the requested scope into the grants that will actually be
    /// issued, grouped per database.
    ///
    /// Tables without a single allowed verb and databases without a single
    /// grantable table are omitted.
    pub fn plan(&self) -> Vec<DatabaseGrants> {
        self.0
            .iter()
            .filter_map(|(database, tables)| {
                let tables: Vec<TableGrant> = tables
                    .iter()
                    .filter_map(|(table, verbs)| {
                        let granted: Vec<&'static str> = ALLOWED_VERBS
                            .iter()
                            .copied()
                            .filter(|verb| verbs.get(*verb).copied().unwrap_or(false))
                            .collect();

                        (!granted.is_empty()).then(|| TableGrant {
                            table: table.clone(),
                            verbs: granted,
                        })
                    })
                    .collect();

                (!tables.is_empty()).then(|| DatabaseGrants {
                    database: database.clone(),
                    tables,
                })
            })
            .collect()
    }
}

impl From<BTreeMap<String, TablePermissions>> for PermissionSet {
    fn from(scope: BTreeMap<String, TablePermissions>) -> Self {
        Self(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_verbs() {
        for verb in ALLOWED_VERBS {
            assert!(is_allowed_verb(verb));
        }
        assert!(!is_allowed_verb("DROP"));
        assert!(!is_allowed_verb("ALL"));
        assert!(!is_allowed_verb("select"));
        assert!(!is_allowed_verb(""));
    }

    #[test]
    fn test_plan_drops_unknown_verbs() {
        let permissions: PermissionSet = serde_json::from_str(
            r#"{"orders": {"invoices": {"SELECT": true, "DROP": true}}}"#,
        )
        .unwrap();

        let plan = permissions.plan();
        assert_eq!(
            plan,
            vec![DatabaseGrants {
                database: "orders".to_string(),
                tables: vec![TableGrant {
                    table: "invoices".to_string(),
                    verbs: vec!["SELECT"],
                }],
            }]
        );
    }

    #[test]
    fn test_plan_skips_denied_verbs_and_empty_tables() {
        let permissions = PermissionSet::new()
            .with("orders", "invoices", "SELECT", false)
            .with("orders", "invoices", "GRANT OPTION", true)
            .with("orders", "customers", "UPDATE", true)
            .with("orders", "customers", "INSERT", true)
            .with("billing", "ledger", "DELETE", false);

        let plan = permissions.plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].database, "orders");
        assert_eq!(plan[0].tables.len(), 1);
        assert_eq!(plan[0].tables[0].table, "customers");
        // allow-list order, not insertion order
        assert_eq!(plan[0].tables[0].verbs, vec!["INSERT", "UPDATE"]);
    }

    #[test]
    fn test_plan_never_contains_unlisted_verbs() {
        let verbs = [
            "SELECT", "DROP", "ALTER", "INSERT", "select", "CONNECT", "TRIGGER", "ALL",
            "USAGE", "DELETE; DROP TABLE x", "TRUNCATE", "REFERENCES", "UPDATE", "DELETE",
        ];

        let mut permissions = PermissionSet::new();
        for (i, verb) in verbs.iter().enumerate() {
            let table = format!("t{}", i % 3);
            permissions = permissions.with("db", &table, verb, i % 2 == 0 || verb.len() > 5);
        }

        for database in permissions.plan() {
            for table in database.tables {
                assert!(!table.verbs.is_empty());
                for verb in table.verbs {
                    assert!(is_allowed_verb(verb), "unexpected verb {verb}");
                }
            }
        }
    }

    #[test]
    fn test_counts() {
        let permissions = PermissionSet::new()
            .with("a", "t1", "SELECT", true)
            .with("a", "t2", "SELECT", true)
            .with("b", "t1", "SELECT", true);

        assert_eq!(permissions.database_count(), 2);
        assert_eq!(permissions.table_count(), 3);
        assert!(!permissions.is_empty());
        assert!(PermissionSet::new().plan().is_empty());
    }
}
