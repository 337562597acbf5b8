//! JSON:API query-string helpers.

use std::collections::BTreeMap;

/// `include`, `filter[...]` and `sort` parameters for a JSON:API request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonApiQuery {
    /// Already-encoded `key=value` parts, e.g. a GET payload. They come first.
    pub initial: Vec<String>,
    pub include: Vec<String>,
    pub filter: BTreeMap<String, String>,
    pub sort: Vec<String>,
}

impl JsonApiQuery {
    /// Query parts in `initial, include, filter, sort` order.
    fn parts(&self) -> Vec<String> {
        let mut parts = self.initial.clone();
        parts.extend(list("include", &self.include));
        parts.extend(
            self.filter
                .iter()
                .map(|(attr, value)| format!("filter[{attr}]={value}")),
        );
        parts.extend(list("sort", &self.sort));
        parts
    }

    /// `?a&b...`, or an empty string when there is nothing to add.
    pub fn to_query_string(&self) -> String {
        let parts = self.parts();
        if parts.is_empty() {
            String::new()
        } else {
            format!("?{}", parts.join("&"))
        }
    }
}

fn list(key: &str, values: &[String]) -> Option<String> {
    (!values.is_empty()).then(|| format!("{key}={}", values.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_is_empty_string() {
        assert_eq!(JsonApiQuery::default().to_query_string(), "");
    }

    #[test]
    fn parts_follow_initial_include_filter_sort_order() {
        let query = JsonApiQuery {
            initial: vec!["page=2".into()],
            include: vec!["author".into(), "tags".into()],
            filter: BTreeMap::from([("status".into(), "open".into())]),
            sort: vec!["-created".into()],
        };
        assert_eq!(
            query.to_query_string(),
            "?page=2&include=author,tags&filter[status]=open&sort=-created"
        );
    }
}
