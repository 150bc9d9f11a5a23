//! Relation catalog: which files/tables correspond and how their columns line up.

use crate::config::{ConfigFile, Engine, RelationDefinition};
use crate::error::{Result, SyncError};
use crate::value::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One file/table taking part in a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub source: String,
    /// Empty for DBF, where the file is the table
    pub table: String,
    pub fields: Vec<String>,
}

/// A declared correspondence between two or more participants.
/// `participants[i].fields[k]` is the same logical column for every `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    participants: Vec<Participant>,
}

impl Relation {
    pub fn new(participants: Vec<Participant>) -> Result<Self> {
        if participants.len() < 2 {
            return Err(SyncError::RelationConfig(format!(
                "a relation needs at least two sources, got {}",
                participants.len()
            )));
        }

        let width = participants[0].fields.len();
        if width == 0 {
            return Err(SyncError::RelationConfig(format!(
                "relation on '{}' declares no fields",
                participants[0].source
            )));
        }
        if let Some(p) = participants.iter().find(|p| p.fields.len() != width) {
            return Err(SyncError::RelationConfig(format!(
                "'{}' declares {} fields, expected {}",
                p.source,
                p.fields.len(),
                width
            )));
        }

        Ok(Relation { participants })
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn contains_source(&self, filename: &str) -> bool {
        self.participants.iter().any(|p| p.source == filename)
    }
}

impl TryFrom<&RelationDefinition> for Relation {
    type Error = SyncError;

    fn try_from(def: &RelationDefinition) -> Result<Self> {
        let n = def.sources.len();
        if def.tables.len() != n || def.fields.len() != n {
            return Err(SyncError::RelationConfig(format!(
                "sources, tables and fields must have the same length (got {}, {}, {})",
                n,
                def.tables.len(),
                def.fields.len()
            )));
        }

        let participants = def
            .sources
            .iter()
            .zip(&def.tables)
            .zip(&def.fields)
            .map(|((source, table), fields)| Participant {
                source: source.clone(),
                table: table.clone(),
                fields: fields.iter().map(|f| f.to_lowercase()).collect(),
            })
            .collect();

        Relation::new(participants)
    }
}

/// A participant resolved against storage: engine, path, table, columns and,
/// once read, its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTable {
    pub engine: Engine,
    /// Source name as declared in the relation
    pub source: String,
    pub path: PathBuf,
    pub table: String,
    pub fields: Vec<String>,
    pub rows: Vec<Row>,
}

impl SyncTable {
    /// The same table carrying `rows`.
    pub fn with_rows(&self, rows: Vec<Row>) -> SyncTable {
        SyncTable {
            rows,
            ..self.clone()
        }
    }

    /// Whether `other` names the same physical table.
    pub fn same_table(&self, other: &SyncTable) -> bool {
        self.source == other.source && self.table == other.table
    }

    pub fn label(&self) -> String {
        if self.table.is_empty() {
            self.source.clone()
        } else {
            format!("{}:{}", self.source, self.table)
        }
    }
}

/// The loaded relations plus the folder and extension tables used to
/// resolve sources.
#[derive(Debug, Clone)]
pub struct Catalog {
    relations: Vec<Relation>,
    folderpaths: HashMap<Engine, Vec<PathBuf>>,
    extensions: HashMap<Engine, Vec<String>>,
}

impl Catalog {
    /// Validate a parsed config file into a catalog.
    pub fn from_config(config: &ConfigFile) -> Result<Self> {
        let relations = config
            .relations
            .iter()
            .enumerate()
            .map(|(i, def)| {
                Relation::try_from(def).map_err(|e| match e {
                    SyncError::RelationConfig(msg) => {
                        SyncError::RelationConfig(format!("relation #{}: {msg}", i + 1))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let folderpaths = config
            .folderpaths
            .iter()
            .map(|(engine, dirs)| (*engine, dirs.iter().map(PathBuf::from).collect()))
            .collect();

        let extensions = config
            .extensions
            .iter()
            .map(|(engine, exts)| (*engine, exts.iter().map(|e| normalize_extension(e)).collect()))
            .collect();

        let catalog = Catalog {
            relations,
            folderpaths,
            extensions,
        };

        // Every declared source must map to an engine up front.
        for relation in &catalog.relations {
            for p in relation.participants() {
                catalog.engine_for(&p.source)?;
            }
        }

        Ok(catalog)
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Every relation listing `filename` among its sources.
    pub fn relations_touched_by(&self, filename: &str) -> Vec<&Relation> {
        self.relations
            .iter()
            .filter(|r| r.contains_source(filename))
            .collect()
    }

    /// Whether any relation names `filename` as a source.
    pub fn is_governed(&self, filename: &str) -> bool {
        self.relations.iter().any(|r| r.contains_source(filename))
    }

    /// Engine family for a source, by extension, ignoring case.
    pub fn engine_for(&self, source: &str) -> Result<Engine> {
        let ext = Path::new(source)
            .extension()
            .and_then(|e| e.to_str())
            .map(normalize_extension)
            .ok_or_else(|| SyncError::UnknownEngine(source.to_string()))?;

        Engine::ALL
            .into_iter()
            .find(|engine| self.extensions_for(*engine).contains(&ext))
            .ok_or_else(|| SyncError::UnknownEngine(source.to_string()))
    }

    /// Extensions of an engine family, lower-case with a leading dot.
    pub fn extensions_for(&self, engine: Engine) -> &[String] {
        self.extensions.get(&engine).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn folders_for(&self, engine: Engine) -> &[PathBuf] {
        self.folderpaths.get(&engine).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve a source name to a path. Bare names live in the engine's
    /// first folder; anything with a directory component is used as given.
    pub fn resolve_path(&self, engine: Engine, source: &str) -> PathBuf {
        let path = Path::new(source);
        if path.is_absolute() || path.components().count() > 1 {
            return path.to_path_buf();
        }
        match self.folders_for(engine).first() {
            Some(folder) => folder.join(source),
            None => path.to_path_buf(),
        }
    }

    /// Build row-less tables for every participant of `relation`.
    pub fn resolve_participants(&self, relation: &Relation) -> Result<Vec<SyncTable>> {
        relation
            .participants()
            .iter()
            .map(|p| {
                let engine = self.engine_for(&p.source)?;
                Ok(SyncTable {
                    engine,
                    source: p.source.clone(),
                    path: self.resolve_path(engine, &p.source),
                    table: p.table.clone(),
                    fields: p.fields.clone(),
                    rows: Vec::new(),
                })
            })
            .collect()
    }
}

fn normalize_extension(ext: &str) -> String {
    format!(".{}", ext.trim_start_matches('.').to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_str;

    const CONFIG: &str = r#"
folderpaths:
  DBF: ["/data/dbf"]
  SQL: ["/data/sql"]
extensions:
  DBF: [".dbf"]
  SQL: [".sql", "db"]
relations:
  - sources: ["a.dbf", "b.sql"]
    tables: ["", "users"]
    fields: [["ID", "name"], ["user_id", "full_name"]]
  - sources: ["a.dbf", "c.dbf"]
    tables: ["", ""]
    fields: [["id"], ["id"]]
"#;

    fn catalog() -> Catalog {
        Catalog::from_config(&parse_config_str(CONFIG).unwrap()).unwrap()
    }

    #[test]
    fn test_relations_touched_by() {
        let catalog = catalog();
        assert_eq!(catalog.relations_touched_by("a.dbf").len(), 2);
        assert_eq!(catalog.relations_touched_by("b.sql").len(), 1);
        assert!(catalog.relations_touched_by("other.dbf").is_empty());
    }

    #[test]
    fn test_engine_is_case_insensitive() {
        let catalog = catalog();
        assert_eq!(catalog.engine_for("A.DBF").unwrap(), Engine::Dbf);
        assert_eq!(catalog.engine_for("x.Db").unwrap(), Engine::Sql);
        assert!(matches!(
            catalog.engine_for("notes.txt"),
            Err(SyncError::UnknownEngine(_))
        ));
        assert!(matches!(
            catalog.engine_for("README"),
            Err(SyncError::UnknownEngine(_))
        ));
    }

    #[test]
    fn test_resolve_participants() {
        let catalog = catalog();
        let tables = catalog
            .resolve_participants(&catalog.relations()[0])
            .unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].engine, Engine::Dbf);
        assert_eq!(tables[0].path, PathBuf::from("/data/dbf/a.dbf"));
        assert_eq!(tables[0].fields, vec!["id", "name"]);
        assert_eq!(tables[1].engine, Engine::Sql);
        assert_eq!(tables[1].table, "users");
        assert!(tables[1].rows.is_empty());
    }

    #[test]
    fn test_resolve_path_keeps_explicit_paths() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve_path(Engine::Sql, "sub/b.sql"),
            PathBuf::from("sub/b.sql")
        );
        assert_eq!(
            catalog.resolve_path(Engine::Sql, "b.sql"),
            PathBuf::from("/data/sql/b.sql")
        );
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let config = parse_config_str(
            r#"
extensions: { DBF: [".dbf"], SQL: [".sql"] }
relations:
  - sources: ["a.dbf", "b.sql"]
    tables: [""]
    fields: [["id"], ["id"]]
"#,
        )
        .unwrap();
        match Catalog::from_config(&config) {
            Err(SyncError::RelationConfig(msg)) => assert!(msg.contains("relation #1")),
            other => panic!("Expected RelationConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_unequal_field_widths_rejected() {
        let config = parse_config_str(
            r#"
extensions: { DBF: [".dbf"], SQL: [".sql"] }
relations:
  - sources: ["a.dbf", "b.sql"]
    tables: ["", "t"]
    fields: [["id", "name"], ["id"]]
"#,
        )
        .unwrap();
        assert!(matches!(
            Catalog::from_config(&config),
            Err(SyncError::RelationConfig(_))
        ));
    }

    #[test]
    fn test_single_source_rejected() {
        let def = RelationDefinition {
            sources: vec!["a.dbf".into()],
            tables: vec!["".into()],
            fields: vec![vec!["id".into()]],
        };
        assert!(matches!(
            Relation::try_from(&def),
            Err(SyncError::RelationConfig(_))
        ));
    }

    #[test]
    fn test_unknown_engine_in_relation_fails_load() {
        let config = parse_config_str(
            r#"
extensions: { DBF: [".dbf"] }
relations:
  - sources: ["a.dbf", "b.csv"]
    tables: ["", ""]
    fields: [["id"], ["id"]]
"#,
        )
        .unwrap();
        assert!(matches!(
            Catalog::from_config(&config),
            Err(SyncError::UnknownEngine(_))
        ));
    }
}
