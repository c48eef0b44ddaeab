//! Listing parameters parsed from request query strings.

use url::form_urlencoded;
use url::Url;

use crate::error::{DomainError, DomainResult};
use crate::filter::{Condition, Filter};
use crate::object::Object;
use crate::pagination::Pagination;
use crate::sort::{parse_sort, SortOrder};

/// Parsed `_limit`, `_sort`, `_token` and filter parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    pub condition: Condition,
    pub sort: Vec<SortOrder>,
    pub limit: usize,
    pub token: Option<Pagination>,
}

impl Params {
    /// Parses a raw query string (without the leading `?`).
    pub fn parse(query: &str, max_limit: usize) -> DomainResult<Self> {
        Self::from_pairs(form_urlencoded::parse(query.as_bytes()), max_limit)
    }

    /// Parses the query of a request URL.
    pub fn from_url(url: &Url, max_limit: usize) -> DomainResult<Self> {
        Self::from_pairs(url.query_pairs(), max_limit)
    }

    /// Parses decoded key/value pairs. `_limit` defaults to `max_limit`.
    pub fn from_pairs<I, K, V>(pairs: I, max_limit: usize) -> DomainResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Params {
            limit: max_limit,
            ..Params::default()
        };

        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            let filter = match key {
                "_limit" => {
                    params.limit = parse_limit(value, max_limit);
                    continue;
                }
                "_sort" => {
                    params.sort = parse_sort(value);
                    continue;
                }
                "_token" => {
                    if let Some(token) = Pagination::decode(value)? {
                        params.token = Some(token);
                    }
                    continue;
                }
                "_fields" => continue,
                "_before" => Filter::parse("lt_last_modified", value),
                "_since" => Filter::parse("gt_last_modified", value),
                _ => Filter::parse(key, value),
            };
            if filter.is_valid() {
                params.condition.push(filter);
            }
        }
        Ok(params)
    }

    /// Builds the URL of the next page, replacing `_limit` and `_token`.
    pub fn next_page_url(&self, current: &Url, nonce: &str, last: &Object) -> DomainResult<Url> {
        let token = Pagination::new(nonce, last, &self.sort).encode()?;
        let retained: Vec<(String, String)> = current
            .query_pairs()
            .filter(|(k, _)| *k != "_limit" && *k != "_token")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut next = current.clone();
        next.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair("_limit", &self.limit.to_string())
            .append_pair("_token", &token);
        Ok(next)
    }
}

/// Parses `_limit`: negative or malformed values become 0, and with a
/// positive `max` anything outside `1..=max` becomes `max`.
pub fn parse_limit(raw: &str, max: usize) -> usize {
    let n = raw.trim().parse::<i64>().unwrap_or(0).max(0);
    let n = usize::try_from(n).unwrap_or(usize::MAX);
    if max > 0 && (n < 1 || n > max) {
        max
    } else {
        n
    }
}

/// Parses an absolute URL.
pub fn parse_url(raw: &str) -> DomainResult<Url> {
    Url::parse(raw).map_err(|e| DomainError::InvalidUrl {
        message: e.to_string(),
    })
}
