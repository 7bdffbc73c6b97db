use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three fixed board groupings published by the listing site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Industry,
    Concept,
    Region,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Industry, Category::Concept, Category::Region];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Industry => "industry",
            Category::Concept => "concept",
            Category::Region => "region",
        }
    }

    /// Path segment the site uses for this grouping.
    pub fn site_path(&self) -> &'static str {
        match self {
            Category::Industry => "thshy",
            Category::Concept => "gn",
            Category::Region => "dy",
        }
    }

    /// Accepts the stored name, the site path, or the numeric code `1..=3`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "industry" | "thshy" | "1" => Some(Category::Industry),
            "concept" | "gn" | "2" => Some(Category::Concept),
            "region" | "dy" | "3" => Some(Category::Region),
            _ => None,
        }
    }

    pub fn listing_url(&self, base: &str, page: u32) -> String {
        let field = match self {
            Category::Concept => "addtime",
            _ => "199112",
        };
        format!(
            "{}/{}/index/field/{}/order/desc/page/{}/ajax/1/",
            base.trim_end_matches('/'),
            self.site_path(),
            field,
            page
        )
    }

    pub fn detail_url(&self, base: &str, board_code: &str, page: u32) -> String {
        format!(
            "{}/{}/detail/field/199112/order/desc/page/{}/ajax/1/code/{}/",
            base.trim_end_matches('/'),
            self.site_path(),
            page,
            board_code
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchStatus {
    Running,
    Success,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "running" => Some(BatchStatus::Running),
            "success" => Some(BatchStatus::Success),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    Added,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeKind::Added),
            "removed" => Some(ChangeKind::Removed),
            _ => None,
        }
    }
}

/// One board as it will be persisted for a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Board {
    pub name: String,
    pub source_url: String,
    pub driving_event: Option<String>,
    pub declared_count: Option<i64>,
    pub listed_on: Option<String>,
}

/// One constituent of a board. `(board_name, code)` is unique per batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub board_name: String,
    pub code: String,
    pub name: String,
    pub sequence: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: i64,
    pub category: Category,
    pub status: BatchStatus,
    pub total_boards: i64,
    pub total_items: i64,
    pub elapsed_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSummary {
    pub id: i64,
    pub batch_id: i64,
    pub category: Category,
    pub prev_batch_id: Option<i64>,
    pub boards_added: i64,
    pub boards_removed: i64,
    pub items_added: i64,
    pub items_removed: i64,
    pub change_rate: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parse_accepts_all_spellings() {
        assert_eq!(Category::parse("concept"), Some(Category::Concept));
        assert_eq!(Category::parse("GN"), Some(Category::Concept));
        assert_eq!(Category::parse("1"), Some(Category::Industry));
        assert_eq!(Category::parse(" dy "), Some(Category::Region));
        assert_eq!(Category::parse("4"), None);
    }

    #[test]
    fn listing_urls_use_category_sort_field() {
        let base = "https://q.10jqka.com.cn/";
        assert_eq!(
            Category::Concept.listing_url(base, 3),
            "https://q.10jqka.com.cn/gn/index/field/addtime/order/desc/page/3/ajax/1/"
        );
        assert_eq!(
            Category::Industry.listing_url(base, 1),
            "https://q.10jqka.com.cn/thshy/index/field/199112/order/desc/page/1/ajax/1/"
        );
        assert_eq!(
            Category::Region.detail_url(base, "881101", 2),
            "https://q.10jqka.com.cn/dy/detail/field/199112/order/desc/page/2/ajax/1/code/881101/"
        );
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [BatchStatus::Running, BatchStatus::Success, BatchStatus::Failed] {
            assert_eq!(BatchStatus::parse_status(s.as_str()), Some(s));
        }
        assert_eq!(BatchStatus::parse_status("RUNNING"), None);
    }
}
