//! Database schema types.
//!
//! Represents the introspected structure of a database: tables, columns,
//! indexes, foreign keys, views, and stored procedures.

use serde::{Deserialize, Serialize};

/// Represents the complete schema of a database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    /// All base tables.
    pub tables: Vec<Table>,

    /// View names.
    pub views: Vec<String>,

    /// Stored procedure / function names, where the dialect has them.
    pub procedures: Vec<String>,
}

impl Schema {
    /// Creates a new empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Formats the schema for inclusion in tool output or an LLM prompt.
    pub fn format_for_llm(&self) -> String {
        let mut out = String::from("Database Schema:\n\n");
        for table in &self.tables {
            out.push_str(&table.format_for_llm());
            out.push('\n');
        }
        if !self.views.is_empty() {
            out.push_str(&format!("Views: {}\n", self.views.join(", ")));
        }
        if !self.procedures.is_empty() {
            out.push_str(&format!("Procedures: {}\n", self.procedures.join(", ")));
        }
        out
    }
}

/// A table with its columns, indexes, and outgoing foreign keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    fn format_for_llm(&self) -> String {
        let mut out = format!("Table: {}\n", self.name);
        for column in &self.columns {
            let mut annotations = Vec::new();
            if column.primary_key {
                annotations.push("PK".to_string());
            }
            if !column.nullable {
                annotations.push("NOT NULL".to_string());
            }
            if let Some(fk) = self
                .foreign_keys
                .iter()
                .find(|fk| fk.column == column.name)
            {
                annotations.push(format!("FK -> {}.{}", fk.ref_table, fk.ref_column));
            }
            if let Some(default) = &column.default {
                annotations.push(format!("DEFAULT {default}"));
            }
            if annotations.is_empty() {
                out.push_str(&format!("  - {}: {}\n", column.name, column.data_type));
            } else {
                out.push_str(&format!(
                    "  - {}: {} ({})\n",
                    column.name,
                    column.data_type,
                    annotations.join(", ")
                ));
            }
        }
        out
    }

    /// Names of the primary key columns, in declaration order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// A column definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub default: Option<String>,
}

impl Column {
    /// Creates a nullable, non-key column (test helper shape).
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
            default: None,
        }
    }
}

/// A secondary index on a table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// A single-column foreign key relationship.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}
