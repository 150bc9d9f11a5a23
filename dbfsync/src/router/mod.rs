use crate::catalog::{Catalog, SyncTable};
use crate::error::Result;
use std::path::Path;

/// One origin table with every destiny it feeds in this pass.
/// `origin_fields[i]` are the origin columns aligned with `destinies[i].fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct AffectedGroup {
    pub origin: SyncTable,
    pub origin_fields: Vec<Vec<String>>,
    pub destinies: Vec<SyncTable>,
}

impl AffectedGroup {
    /// Destinies paired with the origin columns aligned to them.
    pub fn pairs(&self) -> impl Iterator<Item = (&[String], &SyncTable)> {
        self.origin_fields
            .iter()
            .map(Vec::as_slice)
            .zip(&self.destinies)
    }
}

/// Map changed files to the origin/destiny groups they drive.
///
/// For every relation naming a changed file, that file's participant is the
/// origin and every other participant a destiny. Groups sharing an origin
/// table are merged. Names that match no relation are ignored.
pub fn affected_groups<S: AsRef<str>>(
    changed: &[S],
    catalog: &Catalog,
) -> Result<Vec<AffectedGroup>> {
    let mut groups: Vec<AffectedGroup> = Vec::new();

    for filename in changed {
        let filename = filename.as_ref();

        for relation in catalog.relations_touched_by(filename) {
            let tables = catalog.resolve_participants(relation)?;
            let (origins, destinies): (Vec<SyncTable>, Vec<SyncTable>) =
                tables.into_iter().partition(|t| t.source == filename);

            for origin in origins {
                let others: Vec<SyncTable> = destinies
                    .iter()
                    .filter(|d| !d.same_table(&origin))
                    .cloned()
                    .collect();
                if others.is_empty() {
                    continue;
                }

                let pos = match groups.iter().position(|g| g.origin.same_table(&origin)) {
                    Some(pos) => pos,
                    None => {
                        groups.push(AffectedGroup {
                            origin: origin.clone(),
                            origin_fields: Vec::new(),
                            destinies: Vec::new(),
                        });
                        groups.len() - 1
                    }
                };
                let group = &mut groups[pos];

                for destiny in others {
                    log::debug!("{} -> {}", origin.label(), destiny.label());
                    group.origin_fields.push(origin.fields.clone());
                    group.destinies.push(destiny);
                }
            }
        }
    }

    Ok(groups)
}

/// Reduce changed paths to the file names relations refer to.
pub fn changed_filenames<P: AsRef<Path>>(paths: &[P]) -> Vec<String> {
    let mut names: Vec<String> = paths
        .iter()
        .filter_map(|p| p.as_ref().file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_str;
    use std::path::PathBuf;

    fn catalog(yaml: &str) -> Catalog {
        Catalog::from_config(&parse_config_str(yaml).unwrap()).unwrap()
    }

    const TWO_WAY: &str = r#"
folderpaths: { DBF: ["/dbf"], SQL: ["/sql"] }
extensions: { DBF: [".dbf"], SQL: [".sql"] }
relations:
  - sources: ["a.dbf", "b.sql"]
    tables: ["", "users"]
    fields: [["id", "name"], ["uid", "uname"]]
"#;

    #[test]
    fn test_origin_is_the_changed_file() {
        let catalog = catalog(TWO_WAY);
        let groups = affected_groups(&["a.dbf"], &catalog).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].origin.source, "a.dbf");
        assert_eq!(groups[0].destinies.len(), 1);
        assert_eq!(groups[0].destinies[0].source, "b.sql");
        assert_eq!(groups[0].origin_fields, vec![vec!["id", "name"]]);
    }

    #[test]
    fn test_reverse_direction() {
        let catalog = catalog(TWO_WAY);
        let groups = affected_groups(&["b.sql"], &catalog).unwrap();
        assert_eq!(groups[0].origin.source, "b.sql");
        assert_eq!(groups[0].origin.table, "users");
        assert_eq!(groups[0].destinies[0].source, "a.dbf");
        assert_eq!(groups[0].origin_fields, vec![vec!["uid", "uname"]]);
    }

    #[test]
    fn test_unrelated_files_dropped() {
        let catalog = catalog(TWO_WAY);
        assert!(affected_groups(&["other.dbf"], &catalog).unwrap().is_empty());
    }

    #[test]
    fn test_groups_merge_per_origin() {
        let catalog = catalog(
            r#"
extensions: { DBF: [".dbf"], SQL: [".sql"] }
relations:
  - sources: ["a.dbf", "b.sql"]
    tables: ["", "users"]
    fields: [["id", "name"], ["id", "name"]]
  - sources: ["a.dbf", "c.dbf", "d.sql"]
    tables: ["", "", "people"]
    fields: [["id"], ["code"], ["pid"]]
"#,
        );
        let groups = affected_groups(&["a.dbf"], &catalog).unwrap();
        assert_eq!(groups.len(), 1);

        let group = &groups[0];
        let destinies: Vec<&str> = group.destinies.iter().map(|d| d.source.as_str()).collect();
        assert_eq!(destinies, vec!["b.sql", "c.dbf", "d.sql"]);
        assert_eq!(
            group.origin_fields,
            vec![vec!["id", "name"], vec!["id"], vec!["id"]]
        );

        let pairs: Vec<(usize, &str)> = group
            .pairs()
            .map(|(fields, d)| (fields.len(), d.source.as_str()))
            .collect();
        assert_eq!(pairs, vec![(2, "b.sql"), (1, "c.dbf"), (1, "d.sql")]);
    }

    #[test]
    fn test_changed_filenames() {
        let paths = vec![
            PathBuf::from("/data/dbf/a.dbf"),
            PathBuf::from("/data/dbf/a.dbf"),
            PathBuf::from("relative/b.dbf"),
        ];
        assert_eq!(changed_filenames(&paths), vec!["a.dbf", "b.dbf"]);
    }
}
