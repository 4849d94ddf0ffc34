use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// List payload that is either a `{ "results": [...] }` page or a bare array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Paginated<T> {
    Page {
        results: Vec<T>,
        #[serde(default)]
        count: Option<u64>,
        #[serde(default)]
        next: Option<String>,
        #[serde(default)]
        previous: Option<String>,
    },
    List(Vec<T>),
}

impl<T> Paginated<T> {
    pub fn items(&self) -> &[T] {
        match self {
            Paginated::Page { results, .. } => results,
            Paginated::List(items) => items,
        }
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            Paginated::Page { results, .. } => results,
            Paginated::List(items) => items,
        }
    }

    /// Link to the following page, if the server paginates.
    pub fn next(&self) -> Option<&str> {
        match self {
            Paginated::Page { next, .. } => next.as_deref(),
            Paginated::List(_) => None,
        }
    }

    /// Total number of items across all pages, when reported.
    pub fn count(&self) -> Option<u64> {
        match self {
            Paginated::Page { count, .. } => *count,
            Paginated::List(_) => None,
        }
    }
}

/// Unwrap a list response regardless of whether it carries the `results` envelope.
pub fn unwrap_results<T: DeserializeOwned>(value: Value) -> Result<Vec<T>, serde_json::Error> {
    serde_json::from_value::<Paginated<T>>(value).map(Paginated::into_items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Post {
        id: u32,
    }

    #[test]
    fn unwraps_results_envelope() {
        let posts: Vec<Post> = unwrap_results(json!({
            "count": 2,
            "next": "http://localhost/api/posts/?page=2",
            "previous": null,
            "results": [{ "id": 1 }, { "id": 2 }]
        }))
        .unwrap();
        assert_eq!(posts, vec![Post { id: 1 }, Post { id: 2 }]);
    }

    #[test]
    fn accepts_bare_arrays() {
        let page: Paginated<Post> = serde_json::from_value(json!([{ "id": 3 }])).unwrap();
        assert_eq!(page.items(), &[Post { id: 3 }]);
        assert!(page.next().is_none());
        assert!(page.count().is_none());
    }

    #[test]
    fn exposes_page_links() {
        let page: Paginated<Post> = serde_json::from_value(json!({
            "count": 10,
            "next": "http://localhost/api/posts/?page=2",
            "results": []
        }))
        .unwrap();
        assert_eq!(page.count(), Some(10));
        assert_eq!(page.next(), Some("http://localhost/api/posts/?page=2"));
    }

    #[test]
    fn rejects_other_shapes() {
        assert!(unwrap_results::<Post>(json!({ "detail": "nope" })).is_err());
    }
}
