use serde::Deserialize;

/// Selection rules for tables participating in the import.
///
/// Table names are matched case-sensitively against the names recorded in the
/// export's data-file descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TableFilterConfig {
    /// When non-empty, only these tables are imported.
    #[serde(default)]
    pub include: Vec<String>,
    /// Tables skipped even when they appear in the include list.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TableFilterConfig {
    /// Returns `true` if the table should be imported, `false` otherwise.
    pub fn should_import(&self, table_name: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|t| t == table_name) {
            return false;
        }

        !self.exclude.iter().any(|t| t == table_name)
    }

    /// Returns every name in either list that is not in `known_tables`.
    ///
    /// Unknown names abort the import before any work starts, since a typo in
    /// a filter list would otherwise silently skip a table.
    pub fn unknown_names<'a>(&'a self, known_tables: &[String]) -> Vec<&'a str> {
        self.include
            .iter()
            .chain(self.exclude.iter())
            .filter(|name| !known_tables.iter().any(|t| t == *name))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_imports_everything() {
        let filter = TableFilterConfig::default();
        assert!(filter.should_import("orders"));
    }

    #[test]
    fn include_list_restricts() {
        let filter = TableFilterConfig {
            include: vec!["orders".to_string()],
            exclude: vec![],
        };
        assert!(filter.should_import("orders"));
        assert!(!filter.should_import("items"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = TableFilterConfig {
            include: vec!["orders".to_string()],
            exclude: vec!["orders".to_string()],
        };
        assert!(!filter.should_import("orders"));
    }

    #[test]
    fn unknown_names_are_reported() {
        let filter = TableFilterConfig {
            include: vec!["orders".to_string(), "typo".to_string()],
            exclude: vec![],
        };
        let known = vec!["orders".to_string(), "items".to_string()];
        assert_eq!(filter.unknown_names(&known), vec!["typo"]);
    }
}
