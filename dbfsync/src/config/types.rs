use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Engine family a source file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "DBF", alias = "dbf")]
    Dbf,
    #[serde(rename = "SQL", alias = "sql")]
    Sql,
}

impl Engine {
    pub const ALL: [Engine; 2] = [Engine::Dbf, Engine::Sql];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Dbf => "DBF",
            Engine::Sql => "SQL",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration parsed from config.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Folders watched per engine family. The first folder also resolves
    /// bare source names.
    #[serde(default)]
    pub folderpaths: HashMap<Engine, Vec<String>>,
    /// Extensions recognized per engine family, including the leading dot
    #[serde(default)]
    pub extensions: HashMap<Engine, Vec<String>>,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
}

/// A relation as written in the config file: three parallel lists, one
/// entry per participating file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub sources: Vec<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    pub fields: Vec<Vec<String>>,
}

/// Config written on first run when none exists yet.
pub const CONFIG_TEMPLATE: &str = r#"# dbfsync configuration
folderpaths:
  DBF: ["."]
  SQL: ["."]

extensions:
  DBF: [".dbf"]
  SQL: [".sql"]

# Columns align by position: fields[0][k] and fields[1][k] are the same column.
relations:
  - sources: ["tmp.dbf", "tmp.sql"]
    tables: ["", "users"]
    fields: [["id", "name"], ["id", "name"]]
"#;
