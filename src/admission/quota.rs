use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Prefix of admission counter keys in the shared store.
pub const RATE_LIMIT_PREFIX: &str = "rate-limit";

/// At most `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub window: Duration,
}

impl Quota {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn per_secs(limit: u64, secs: u64) -> Self {
        Self::new(limit, Duration::from_secs(secs))
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.limit, self.window.as_secs())
    }
}

fn invalid(input: &str, details: &str) -> Error {
    Error::configuration_with_context(
        format!("invalid quota '{}'", input),
        ErrorContext::new()
            .with_field_path("quotas")
            .with_details(details),
    )
}

impl FromStr for Quota {
    type Err = Error;

    /// Parses `N/M`: N requests per M seconds, both positive.
    fn from_str(s: &str) -> Result<Self> {
        let (n, m) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid(s, "expected N/M"))?;
        let limit: u64 = n
            .trim()
            .parse()
            .map_err(|_| invalid(s, "request count is not a number"))?;
        let secs: u64 = m
            .trim()
            .parse()
            .map_err(|_| invalid(s, "window is not a whole number of seconds"))?;
        if limit == 0 || secs == 0 {
            return Err(invalid(s, "request count and window must be positive"));
        }
        Ok(Self::per_secs(limit, secs))
    }
}

/// Who shares a quota counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaScope {
    /// One counter per client on the route.
    #[default]
    Client,
    /// One counter for the whole route.
    Route,
}

impl FromStr for QuotaScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "route" => Ok(Self::Route),
            other => Err(invalid(other, "scope must be 'client' or 'route'")),
        }
    }
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Route => f.write_str("route"),
        }
    }
}

/// A quota bound to a route, written `N/M` or `N/M:scope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct RouteQuota {
    pub quota: Quota,
    pub scope: QuotaScope,
}

impl RouteQuota {
    pub fn new(quota: Quota, scope: QuotaScope) -> Self {
        Self { quota, scope }
    }

    /// Counter key for a request from `client` on `route`.
    pub fn scope_key(&self, route: &str, client: &str) -> String {
        match self.scope {
            QuotaScope::Client => format!("{}:{}:{}", RATE_LIMIT_PREFIX, route, client),
            QuotaScope::Route => format!("{}:{}", RATE_LIMIT_PREFIX, route),
        }
    }
}

impl FromStr for RouteQuota {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (quota, scope) = match s.split_once(':') {
            Some((q, scope)) => (q.parse()?, scope.parse()?),
            None => (s.parse()?, QuotaScope::default()),
        };
        Ok(Self::new(quota, scope))
    }
}

impl TryFrom<String> for RouteQuota {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for RouteQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.quota, self.scope)
    }
}

/// Per-route quotas; routes without an entry are not limited.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct QuotaTable {
    routes: BTreeMap<String, RouteQuota>,
}

impl Default for QuotaTable {
    fn default() -> Self {
        let admin = RouteQuota::new(Quota::per_secs(1, 10), QuotaScope::Client);
        Self::empty()
            .with_route(
                "/v1/chat/completions",
                RouteQuota::new(Quota::per_secs(10, 60), QuotaScope::Client),
            )
            .with_route("/cache/key", admin)
            .with_route("/cache/pattern", admin)
            .with_route("/cache/flush", admin)
    }
}

impl QuotaTable {
    pub fn empty() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    pub fn with_route(mut self, route: impl Into<String>, quota: RouteQuota) -> Self {
        self.routes.insert(route.into(), quota);
        self
    }

    pub fn insert(&mut self, route: impl Into<String>, quota: RouteQuota) {
        self.routes.insert(route.into(), quota);
    }

    pub fn get(&self, route: &str) -> Option<&RouteQuota> {
        self.routes.get(route)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RouteQuota)> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Parse `/route=N/M[:scope],...`. Empty items are skipped.
    pub fn parse_list(list: &str) -> Result<Self> {
        let mut table = Self::empty();
        for item in list.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (route, quota) = item
                .split_once('=')
                .ok_or_else(|| invalid(item, "expected /route=N/M[:scope]"))?;
            let route = route.trim();
            if !route.starts_with('/') {
                return Err(invalid(item, "route must start with '/'"));
            }
            table.insert(route, quota.trim().parse()?);
        }
        Ok(table)
    }
}
