use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSchema {
    pub name: String,
    pub tables: Vec<TableSchema>,
}

/// Schema snapshot loaded once per connection generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaCatalog {
    pub databases: Vec<DatabaseSchema>,
}

impl SchemaCatalog {
    #[must_use]
    pub fn database(&self, name: &str) -> Option<&DatabaseSchema> {
        self.databases.iter().find(|database| database.name == name)
    }

    #[must_use]
    pub fn table(&self, database: &str, table: &str) -> Option<&TableSchema> {
        self.database(database)?
            .tables
            .iter()
            .find(|candidate| candidate.name == table)
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.databases
            .iter()
            .map(|database| database.tables.len())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SchemaBackendError {
    message: String,
}

impl SchemaBackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
