use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::data::{EntityName, Record};
use crate::{Error, Result};

/// A foreign table embedded into snapshot rows, e.g. the author of a recado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Key the joined row is stored under
    pub alias: String,
    pub table: String,
    pub columns: Vec<String>,
}

impl Relation {
    pub fn new(alias: &str, table: &str, columns: &[&str]) -> Self {
        Relation {
            alias: alias.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Shape of the rows a snapshot should return.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinShape {
    pub relations: Vec<Relation>,
}

impl JoinShape {
    /// Plain rows, no joined tables
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn with(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn is_plain(&self) -> bool {
        self.relations.is_empty()
    }

    /// Select clause in the `*, alias:table(col,...)` form understood by
    /// PostgREST-style backends.
    pub fn select_clause(&self) -> String {
        let mut clause = String::from("*");
        for relation in &self.relations {
            clause.push_str(&format!(
                ", {}:{}({})",
                relation.alias,
                relation.table,
                relation.columns.join(",")
            ));
        }
        clause
    }
}

/// Result of deleting several rows where each row may fail on its own.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkDeleteOutcome {
    pub success_ids: Vec<String>,
    pub failed_ids: Vec<String>,
}

impl BulkDeleteOutcome {
    pub fn merge(&mut self, other: BulkDeleteOutcome) {
        self.success_ids.extend(other.success_ids);
        self.failed_ids.extend(other.failed_ids);
    }

    pub fn is_complete(&self) -> bool {
        self.failed_ids.is_empty()
    }
}

/// Full-state reads of an entity collection.
pub trait SnapshotSource: Send + Sync {
    fn fetch_snapshot<'a>(
        &'a self,
        entity: EntityName,
        join: &'a JoinShape,
    ) -> BoxFuture<'a, Result<Vec<Record>>>;
}

/// Writes against the backend. Every call may fail with a transport error.
pub trait MutationBackend: Send + Sync {
    fn create<'a>(&'a self, entity: EntityName, values: Record) -> BoxFuture<'a, Result<Record>>;

    fn update<'a>(
        &'a self,
        entity: EntityName,
        id: &'a str,
        values: Record,
    ) -> BoxFuture<'a, Result<Record>>;

    /// Returns false when the row was not deleted (missing or refused).
    fn delete<'a>(&'a self, entity: EntityName, id: &'a str) -> BoxFuture<'a, Result<bool>>;

    fn supports_bulk_delete(&self, _entity: EntityName) -> bool {
        false
    }

    fn bulk_delete<'a>(
        &'a self,
        entity: EntityName,
        _ids: &'a [String],
    ) -> BoxFuture<'a, Result<BulkDeleteOutcome>> {
        Box::pin(async move { Err(Error::BulkDeleteUnsupported(entity)) })
    }

    /// Record that the current user has seen a row. Best effort.
    fn mark_viewed<'a>(&'a self, _entity: EntityName, _id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
