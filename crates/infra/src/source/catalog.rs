//! Named SQL queries, each parameterized by a single entity id (`$1`).

use std::collections::HashMap;

use vizcache_core::QueryKind;

const COMMITS: &str = r"
SELECT DISTINCT
    r.repo_id AS repo_id,
    c.cmt_commit_hash AS commit_hash,
    c.cmt_author_email AS author_email,
    c.cmt_author_date AS author_date,
    timezone('utc', c.cmt_author_timestamp) AS author_timestamp,
    timezone('utc', c.cmt_committer_timestamp) AS committer_timestamp
FROM repo r
JOIN commits c ON r.repo_id = c.repo_id
WHERE c.repo_id = $1
  AND timezone('utc', c.cmt_author_timestamp) < now()
  AND timezone('utc', c.cmt_committer_timestamp) < now()
";

const ISSUES: &str = r"
SELECT
    r.repo_id,
    r.repo_name,
    i.issue_id AS issue,
    i.gh_issue_number AS issue_number,
    i.gh_issue_id AS gh_issue,
    left(i.reporter_id::text, 15) AS reporter_id,
    left(i.cntrb_id::text, 15) AS issue_closer,
    i.created_at,
    i.closed_at
FROM repo r
JOIN issues i ON r.repo_id = i.repo_id
WHERE r.repo_id = $1
  AND i.pull_request_id IS NULL
  AND i.created_at < now()
  AND (i.closed_at < now() OR i.closed_at IS NULL)
ORDER BY i.created_at
";

const PRS: &str = r"
SELECT
    r.repo_id,
    r.repo_name,
    pr.pull_request_id AS pull_request,
    pr.pr_src_number,
    left(pr.pr_augur_contributor_id::text, 15) AS cntrb_id,
    pr.pr_created_at AS created,
    pr.pr_closed_at AS closed,
    pr.pr_merged_at AS merged
FROM repo r
JOIN pull_requests pr ON r.repo_id = pr.repo_id
WHERE r.repo_id = $1
  AND pr.pr_created_at < now()
  AND (pr.pr_closed_at < now() OR pr.pr_closed_at IS NULL)
  AND (pr.pr_merged_at < now() OR pr.pr_merged_at IS NULL)
ORDER BY pr.pr_created_at
";

const CONTRIBUTORS: &str = r"
SELECT
    ca.repo_id,
    ca.repo_name,
    left(ca.cntrb_id::text, 15) AS cntrb_id,
    timezone('utc', ca.created_at) AS created_at,
    ca.login,
    ca.action,
    ca.rank
FROM explorer_contributor_actions ca
WHERE ca.repo_id = $1
  AND timezone('utc', ca.created_at) < now()
";

/// Maps a [`QueryKind`] to the SQL text that computes it.
#[derive(Debug, Clone, Default)]
pub struct QueryCatalog {
    queries: HashMap<QueryKind, String>,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository activity queries used by the dashboard pages.
    pub fn dashboard_defaults() -> Self {
        let mut catalog = Self::new();
        for (name, sql) in [
            ("commits", COMMITS),
            ("issues", ISSUES),
            ("prs", PRS),
            ("contributors", CONTRIBUTORS),
        ] {
            if let Ok(kind) = QueryKind::new(name) {
                catalog.register(kind, sql);
            }
        }
        catalog
    }

    /// Add or replace a query. The SQL must take the entity as `$1`.
    pub fn register(&mut self, kind: QueryKind, sql: impl Into<String>) -> &mut Self {
        self.queries.insert(kind, sql.into());
        self
    }

    pub fn get(&self, kind: &QueryKind) -> Option<&str> {
        self.queries.get(kind).map(String::as_str)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &QueryKind> {
        self.queries.keys()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_repository_pages() {
        let catalog = QueryCatalog::dashboard_defaults();
        assert_eq!(catalog.len(), 4);
        for name in ["commits", "issues", "prs", "contributors"] {
            let sql = catalog.get(&QueryKind::new(name).unwrap()).unwrap();
            assert!(sql.contains("$1"), "{name} must bind the entity");
        }
    }

    #[test]
    fn register_replaces() {
        let mut catalog = QueryCatalog::new();
        let kind = QueryKind::new("releases").unwrap();
        catalog.register(kind.clone(), "SELECT 1 WHERE $1 IS NOT NULL");
        catalog.register(kind.clone(), "SELECT 2 WHERE $1 IS NOT NULL");
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get(&kind).unwrap().starts_with("SELECT 2"));
    }
}
