// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! In-memory stand-in for the database server used by unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};

use crate::models::AdminCredentials;
use crate::provisioner::{AdminConnector, AdminSession};

#[derive(Default)]
struct State {
    roles: HashSet<String>,
    tables: BTreeMap<String, BTreeSet<String>>,
    /// Successful statements as `(database, sql)`.
    statements: Vec<(String, String)>,
    refused: HashSet<String>,
    failing: Vec<String>,
}

/// Records administrative SQL and tracks which roles exist.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<State>>,
}

impl FakeConnector {
    pub fn add_database(&self, database: &str) {
        let mut state = self.state.lock().unwrap();
        state.tables.entry(database.to_string()).or_default();
    }

    pub fn add_table(&self, database: &str, table: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .tables
            .entry(database.to_string())
            .or_default()
            .insert(table.to_string());
    }

    /// Connections to `database` fail from now on.
    pub fn refuse_database(&self, database: &str) {
        self.state.lock().unwrap().refused.insert(database.to_string());
    }

    /// Statements containing `needle` fail from now on.
    pub fn fail_statements_containing(&self, needle: &str) {
        self.state.lock().unwrap().failing.push(needle.to_string());
    }

    /// Statements fail normally again.
    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.state.lock().unwrap().roles.iter().cloned().collect();
        roles.sort();
        roles
    }

    pub fn has_role(&self, username: &str) -> bool {
        self.state.lock().unwrap().roles.contains(username)
    }

    pub fn statements_starting_with(&self, prefix: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .statements
            .iter()
            .filter(|(_, sql)| sql.starts_with(prefix))
            .cloned()
            .collect()
    }
}

pub struct FakeSession {
    database: String,
    state: Arc<Mutex<State>>,
}

/// Text between the first pair of `quote` characters.
fn quoted(sql: &str, quote: char) -> anyhow::Result<String> {
    let mut parts = sql.split(quote);
    parts.next();
    parts
        .next()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no quoted value in {sql}"))
}

impl AdminConnector for FakeConnector {
    type Session = FakeSession;

    async fn connect(
        &self,
        _admin: &AdminCredentials,
        database: &str,
    ) -> anyhow::Result<FakeSession> {
        if self.state.lock().unwrap().refused.contains(database) {
            bail!("connection to {database} refused");
        }

        Ok(FakeSession {
            database: database.to_string(),
            state: self.state.clone(),
        })
    }
}

impl AdminSession for FakeSession {
    async fn execute(&self, statement: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.failing.iter().any(|needle| statement.contains(needle)) {
            bail!("permission denied");
        }

        if statement.starts_with("CREATE ROLE") {
            let role = quoted(statement, '"')?;
            if !state.roles.insert(role.clone()) {
                bail!("role \"{role}\" already exists");
            }
        } else if statement.starts_with("DROP ROLE IF EXISTS") {
            let role = quoted(statement, '"')?;
            state.roles.remove(&role);
        } else if statement.starts_with("DROP OWNED") || statement.starts_with("GRANT") {
            let role = statement.rsplit('"').nth(1).unwrap_or_default().to_string();
            if !state.roles.contains(&role) {
                bail!("role \"{role}\" does not exist");
            }
        }

        state
            .statements
            .push((self.database.clone(), statement.to_string()));
        Ok(())
    }

    async fn query_column(&self, query: &str) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock().unwrap();

        if query.contains("pg_roles") {
            let role = quoted(query, '\'')?;
            return Ok(state.roles.get(&role).cloned().into_iter().collect());
        }
        if query.contains("pg_database") {
            return Ok(state.tables.keys().cloned().collect());
        }
        if query.contains("information_schema.tables") {
            return Ok(state
                .tables
                .get(&self.database)
                .map(|tables| tables.iter().cloned().collect())
                .unwrap_or_default());
        }

        bail!("unexpected query: {query}")
    }
}
