//! SurrealDB schema initialization
//!
//! Every table shares the [`crate::schema::DocRow`] layout, so each one gets
//! the same set of lookup indexes. Safe to call multiple times.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Tables whose rows are never updated in place once written.
const APPEND_ONLY: &[&str] = &["features", "secret_values"];

/// Every document table.
pub const TABLES: &[&str] = &[
    "projects",
    "environments",
    "project_environments",
    "project_settings",
    "users",
    "features",
    "extensions",
    "project_extensions",
    "secrets",
    "secret_values",
    "service_specs",
    "services",
    "releases",
    "release_extensions",
];

/// Initialize all Berth tables.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Berth SurrealDB schema");

    for table in TABLES {
        init_doc_table(db, table).await?;
    }

    info!("Berth schema initialization complete");
    Ok(())
}

/// Initialize one document table.
///
/// Schema:
/// ```text
/// TABLE <name> {
///   doc_id:          STRING (unique)
///   schema:          INT (document layout version)
///   project_id:      STRING? (indexed)
///   environment_id:  STRING? (indexed)
///   state:           STRING? (indexed)
///   parent_id:       STRING? (indexed)
///   lookup:          STRING? (indexed)
///   created_at:      DATETIME (indexed)
///   version:         INT (compare-and-swap counter)
///   doc:             OBJECT
/// }
/// ```
async fn init_doc_table(db: &Surreal<Any>, table: &str) -> Result<()> {
    debug!("Initializing {} table", table);

    let update = if APPEND_ONLY.contains(&table) {
        "NONE"
    } else {
        "FULL"
    };

    let sql = format!(
        r#"
        DEFINE TABLE IF NOT EXISTS {table} AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update {update}
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_{table}_doc_id ON TABLE {table} COLUMNS doc_id UNIQUE;

        -- Scope queries: everything for one project/environment pair
        DEFINE INDEX IF NOT EXISTS idx_{table}_scope ON TABLE {table} COLUMNS project_id, environment_id;

        DEFINE INDEX IF NOT EXISTS idx_{table}_state ON TABLE {table} COLUMNS state;
        DEFINE INDEX IF NOT EXISTS idx_{table}_parent ON TABLE {table} COLUMNS parent_id;
        DEFINE INDEX IF NOT EXISTS idx_{table}_lookup ON TABLE {table} COLUMNS lookup;
        DEFINE INDEX IF NOT EXISTS idx_{table}_created_at ON TABLE {table} COLUMNS created_at;
    "#
    );

    db.query(sql).await?;
    info!("✓ {} table initialized", table);
    Ok(())
}
