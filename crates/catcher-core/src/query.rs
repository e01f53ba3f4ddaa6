//! Endpoint URLs of the listing service.

use url::Url;

use crate::error::AppError;
use crate::models::ClaimGroupId;
use crate::util::{cache_buster, random_below};

/// One listing request shape. Each scanner owns one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingQuery {
    /// Newest-first, first page of the given size.
    Newest { page_size: u32 },
    /// Newest-first, only items this account qualifies for.
    Qualified,
    /// Newest-first, a deeper page of 25.
    Page(u32),
    /// Highest reward first.
    RewardDesc,
    /// Newest-first, restricted to one requester.
    Requester(String),
}

impl ListingQuery {
    /// The fixed scanner variants, in scanner-index order. Scanners past the
    /// end of this list share the last variant.
    pub fn base_variants() -> Vec<ListingQuery> {
        vec![
            ListingQuery::Newest { page_size: 1 },
            ListingQuery::Newest { page_size: 10 },
            ListingQuery::Newest { page_size: 25 },
            ListingQuery::Qualified,
            ListingQuery::Page(2),
            ListingQuery::RewardDesc,
            ListingQuery::Page(3),
        ]
    }

    /// Variant for scanner `index` among `base_variants()`.
    pub fn for_scanner(index: usize) -> ListingQuery {
        let mut variants = Self::base_variants();
        let idx = index.min(variants.len() - 1);
        variants.swap_remove(idx)
    }

    pub fn label(&self) -> String {
        match self {
            ListingQuery::Newest { page_size } => format!("newest/{page_size}"),
            ListingQuery::Qualified => "qualified".to_string(),
            ListingQuery::Page(n) => format!("page/{n}"),
            ListingQuery::RewardDesc => "reward".to_string(),
            ListingQuery::Requester(id) => format!("requester/{id}"),
        }
    }

    fn apply(&self, url: &mut Url) {
        let mut q = url.query_pairs_mut();
        match self {
            ListingQuery::Newest { page_size } => {
                q.append_pair("sort", "updated_desc")
                    .append_pair("page_size", &page_size.to_string());
            }
            ListingQuery::Qualified => {
                q.append_pair("sort", "updated_desc")
                    .append_pair("page_size", "25")
                    .append_pair("filters[qualified]", "true");
            }
            ListingQuery::Page(n) => {
                q.append_pair("sort", "updated_desc")
                    .append_pair("page_size", "25")
                    .append_pair("page_number", &n.to_string());
            }
            ListingQuery::RewardDesc => {
                q.append_pair("sort", "reward_desc")
                    .append_pair("page_size", "25");
            }
            ListingQuery::Requester(id) => {
                q.append_pair("sort", "updated_desc")
                    .append_pair("page_size", "25")
                    .append_pair("filters[requester_id]", id);
            }
        }
    }
}

/// URL builder for every endpoint the engine talks to.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base = Url::parse(&format!("{trimmed}/"))
            .map_err(|e| AppError::ConfigError(format!("Invalid base URL '{base_url}': {e}")))?;
        Ok(Self { base })
    }

    fn join(&self, path: &str) -> Url {
        // `base` always ends with '/', so joining a relative path never fails
        // for the fixed paths used here.
        self.base.join(path).unwrap_or_else(|_| self.base.clone())
    }

    /// Listing URL with `_` and `r` cache busters.
    pub fn listing(&self, query: &ListingQuery) -> String {
        let mut url = self.join("projects.json");
        query.apply(&mut url);
        url.query_pairs_mut()
            .append_pair("_", &cache_buster())
            .append_pair("r", &random_below(99_991).to_string());
        url.into()
    }

    /// Claim URL for one attempt, with a fresh cache-busting nonce.
    pub fn claim(&self, group_id: &ClaimGroupId) -> String {
        let mut url = self.join(&format!(
            "projects/{}/tasks/accept_random",
            urlencode_segment(group_id.as_str())
        ));
        url.query_pairs_mut().append_pair("_", &cache_buster());
        url.into()
    }

    /// Authoritative outstanding-queue URL.
    pub fn queue(&self) -> String {
        let mut url = self.join("tasks.json");
        url.query_pairs_mut()
            .append_pair("page_size", "25")
            .append_pair("_", &cache_buster());
        url.into()
    }

    /// Page probed for verification challenges; also the page opened for the
    /// operator to solve one.
    pub fn dashboard(&self) -> String {
        let mut url = self.join("dashboard");
        url.query_pairs_mut().append_pair("_", &cache_buster());
        url.into()
    }

    /// Lightweight request that keeps the session warm.
    pub fn keepalive(&self) -> String {
        self.listing(&ListingQuery::Newest { page_size: 1 })
    }
}

fn urlencode_segment(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints::new("https://host.example/").unwrap()
    }

    #[test]
    fn scanner_variants_are_distinct_and_shared_past_the_end() {
        let variants = ListingQuery::base_variants();
        assert_eq!(variants.len(), 7);
        assert_eq!(ListingQuery::for_scanner(0), ListingQuery::Newest { page_size: 1 });
        assert_eq!(ListingQuery::for_scanner(6), ListingQuery::Page(3));
        assert_eq!(ListingQuery::for_scanner(11), ListingQuery::Page(3));
    }

    #[test]
    fn listing_url_carries_query_and_cache_busters() {
        let url = endpoints().listing(&ListingQuery::Qualified);
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/projects.json");
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("sort".into(), "updated_desc".into())));
        assert!(pairs.contains(&("filters[qualified]".into(), "true".into())));
        assert!(pairs.iter().any(|(k, _)| k == "_"));
        assert!(pairs.iter().any(|(k, _)| k == "r"));
        assert!(url.contains("filters%5Bqualified%5D=true"));
    }

    #[test]
    fn requester_query_is_encoded() {
        let url = endpoints().listing(&ListingQuery::Requester("A B&C".into()));
        let parsed = Url::parse(&url).unwrap();
        let requester = parsed
            .query_pairs()
            .find(|(k, _)| k == "filters[requester_id]")
            .map(|(_, v)| v.into_owned());
        assert_eq!(requester.as_deref(), Some("A B&C"));
    }

    #[test]
    fn claim_urls_differ_per_attempt() {
        let ep = endpoints();
        let id = ClaimGroupId::from("3ABCDEF");
        let a = ep.claim(&id);
        let b = ep.claim(&id);
        assert!(a.starts_with("https://host.example/projects/3ABCDEF/tasks/accept_random?_="));
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_endpoints() {
        let ep = Endpoints::new("http://127.0.0.1:8080").unwrap();
        assert!(ep.queue().starts_with("http://127.0.0.1:8080/tasks.json?page_size=25&_="));
        assert!(ep.dashboard().starts_with("http://127.0.0.1:8080/dashboard?_="));
        assert!(ep.keepalive().contains("page_size=1"));
    }

    #[test]
    fn invalid_base_is_config_error() {
        assert!(matches!(
            Endpoints::new("::nope"),
            Err(AppError::ConfigError(_))
        ));
    }
}
