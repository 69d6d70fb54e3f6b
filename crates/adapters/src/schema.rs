use tidal_core::schema_cache::{ColumnSchema, DatabaseSchema, SchemaCatalog, TableSchema};

/// One row of an `information_schema.columns` style listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnListing {
    pub(crate) database: String,
    pub(crate) table: String,
    pub(crate) column: String,
    pub(crate) data_type: String,
    pub(crate) nullable: bool,
}

/// Groups a column listing ordered by database, table and position.
pub(crate) fn catalog_from_listing(listing: Vec<ColumnListing>) -> SchemaCatalog {
    let mut databases: Vec<DatabaseSchema> = Vec::new();
    for entry in listing {
        let last_database = databases.last().map(|database| database.name.as_str());
        if last_database != Some(entry.database.as_str()) {
            databases.push(DatabaseSchema {
                name: entry.database.clone(),
                tables: Vec::new(),
            });
        }
        let Some(database) = databases.last_mut() else {
            continue;
        };

        let last_table = database.tables.last().map(|table| table.name.as_str());
        if last_table != Some(entry.table.as_str()) {
            database.tables.push(TableSchema {
                name: entry.table.clone(),
                columns: Vec::new(),
            });
        }
        if let Some(table) = database.tables.last_mut() {
            table.columns.push(ColumnSchema {
                name: entry.column,
                data_type: entry.data_type,
                nullable: entry.nullable,
            });
        }
    }
    SchemaCatalog { databases }
}
