//! Field extraction for the fixed-layout listing fragments served by the site.
//!
//! Every function is total: malformed input yields `None` or an empty vector,
//! which callers treat as a parse failure and retry.

use once_cell::sync::Lazy;
use regex::Regex;

static TBODY: Lazy<Regex> = Lazy::new(|| Regex::new(r"<tbody>([\w\W]+?)</tbody>").unwrap());
static TR: Lazy<Regex> = Lazy::new(|| Regex::new(r"<tr>([\w\W]+?)</tr>").unwrap());
static DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<td>([0-9-]{10})</td>").unwrap());
static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<td>.+?href="(.+?)".+?>(.+?)</a></td>"#).unwrap());
static TOTAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</td>[\w\W]+?<td>([0-9]+?)</td>").unwrap());
static PAGE_INFO: Lazy<Regex> = Lazy::new(|| Regex::new(r"page_info.+?/([0-9]+?)<").unwrap());
static BOARD_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"code/([0-9]+?)/").unwrap());
static SEQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"<td>([0-9]+?)</td>[\w\W]+?_blank").unwrap());
static CODE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<td>.+?_blank">(.+?)</a>"#).unwrap());

/// Placeholder the site prints for an empty driving-event cell.
const EMPTY_CELL: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardRow {
    pub url: String,
    pub name: String,
    pub driving_event: Option<String>,
    pub listed_on: Option<String>,
    pub declared_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRow {
    pub sequence: Option<i64>,
    pub code: String,
    pub name: String,
}

/// The single `<tbody>` of a page, or `None` when there is not exactly one.
fn table_body(html: &str) -> Option<&str> {
    let mut bodies = TBODY.captures_iter(html);
    let first = bodies.next()?;
    if bodies.next().is_some() {
        return None;
    }
    first.get(1).map(|m| m.as_str())
}

fn rows(body: &str) -> impl Iterator<Item = &str> {
    TR.captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
}

/// Total page count announced by the pager, if present.
pub fn page_count(html: &str) -> Option<u32> {
    PAGE_INFO
        .captures(html)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Numeric board code embedded in a board URL.
pub fn board_code(url: &str) -> Option<&str> {
    BOARD_CODE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

pub fn board_rows(html: &str) -> Vec<BoardRow> {
    let Some(body) = table_body(html) else {
        return Vec::new();
    };
    rows(body).filter_map(parse_board_row).collect()
}

fn parse_board_row(row: &str) -> Option<BoardRow> {
    let mut links = LINK.captures_iter(row);
    let first = links.next()?;
    let url = first.get(1)?.as_str().trim().to_string();
    let name = first.get(2)?.as_str().trim().to_string();
    if name.is_empty() {
        return None;
    }
    let driving_event = links
        .next()
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty() && s != EMPTY_CELL);

    let listed_on = DATE
        .captures(row)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let totals: Vec<_> = TOTAL.captures_iter(row).collect();
    let declared_count = match totals.as_slice() {
        [only] => only.get(1).and_then(|m| m.as_str().parse().ok()),
        _ => None,
    };

    Some(BoardRow {
        url,
        name,
        driving_event,
        listed_on,
        declared_count,
    })
}

pub fn item_rows(html: &str) -> Vec<ItemRow> {
    let Some(body) = table_body(html) else {
        return Vec::new();
    };
    rows(body).filter_map(parse_item_row).collect()
}

fn parse_item_row(row: &str) -> Option<ItemRow> {
    let mut cells = CODE_NAME.captures_iter(row);
    let code = cells.next()?.get(1)?.as_str().trim().to_string();
    let name = cells.next()?.get(1)?.as_str().trim().to_string();
    if code.is_empty() {
        return None;
    }
    let sequence = SEQ
        .captures(row)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    Some(ItemRow {
        sequence,
        code,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<table class="m-table"><thead><tr><th>日期</th></tr></thead>
<tbody>
<tr>
<td>2024-05-10</td>
<td><a href="http://q.10jqka.com.cn/gn/detail/code/308832/" target="_blank">低空经济</a></td>
<td><a href="http://news.example.com/1.html" target="_blank">政策发布</a></td>
<td>96</td>
</tr>
<tr>
<td>2024-05-09</td>
<td><a href="http://q.10jqka.com.cn/gn/detail/code/308700/" target="_blank">固态电池</a></td>
<td>--</td>
<td>41</td>
</tr>
</tbody></table>
<div class="m-pager" id="m-page"><span class="page_info">1/27</span></div>"#;

    const DETAIL: &str = r#"<tbody>
<tr>
<td>1</td>
<td><a href="http://stockpage.10jqka.com.cn/600519/" target="_blank">600519</a></td>
<td><a href="http://stockpage.10jqka.com.cn/600519/" target="_blank">贵州茅台</a></td>
</tr>
<tr>
<td>2</td>
<td><a href="http://stockpage.10jqka.com.cn/000858/" target="_blank">000858</a></td>
<td><a href="http://stockpage.10jqka.com.cn/000858/" target="_blank">五粮液</a></td>
</tr>
</tbody><span class="page_info">1/3</span>"#;

    #[test]
    fn parses_board_listing() {
        let rows = board_rows(LISTING);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "低空经济");
        assert_eq!(rows[0].url, "http://q.10jqka.com.cn/gn/detail/code/308832/");
        assert_eq!(rows[0].driving_event.as_deref(), Some("政策发布"));
        assert_eq!(rows[0].listed_on.as_deref(), Some("2024-05-10"));
        assert_eq!(rows[0].declared_count, Some(96));
        assert_eq!(rows[1].driving_event, None);
        assert_eq!(page_count(LISTING), Some(27));
        assert_eq!(board_code(&rows[1].url), Some("308700"));
    }

    #[test]
    fn parses_item_rows() {
        let rows = item_rows(DETAIL);
        assert_eq!(
            rows,
            vec![
                ItemRow { sequence: Some(1), code: "600519".into(), name: "贵州茅台".into() },
                ItemRow { sequence: Some(2), code: "000858".into(), name: "五粮液".into() },
            ]
        );
        assert_eq!(page_count(DETAIL), Some(3));
    }

    #[test]
    fn missing_or_duplicate_tbody_yields_nothing() {
        assert!(board_rows("<html>blocked</html>").is_empty());
        let doubled = format!("{DETAIL}{DETAIL}");
        assert!(item_rows(&doubled).is_empty());
        assert_eq!(page_count("<html></html>"), None);
        assert_eq!(board_code("http://example.com/nocode"), None);
    }
}
