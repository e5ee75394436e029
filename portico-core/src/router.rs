use crate::error::GatewayError;
use crate::route::{PathRule, Route};
use crate::snapshot::ConfigSnapshot;
use arc_swap::ArcSwap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Thread-safe router over a compiled, immutable route table.
///
/// The compiled table is swapped atomically on snapshot publish; the hot
/// path only performs an `arc_swap` load plus index lookups. Host
/// constraints are pre-compiled so matching never touches the raw route
/// list.
pub struct Router {
    inner: ArcSwap<CompiledRouter>,

    /// Monotonically-increasing version, bumped on every reload.
    /// Used by workers to invalidate their per-thread caches.
    version: AtomicU64,
}

/// Pre-compiled host constraints for a route.
#[derive(Clone, Debug)]
struct HostConstraint {
    /// Exact hosts (lowercased, no wildcards).
    exact: Vec<String>,
    /// Wildcard suffixes (`*.example.com` → `.example.com`).
    wildcard_suffixes: Vec<String>,
}

impl HostConstraint {
    fn from_route(route: &Route) -> Self {
        let mut exact = Vec::new();
        let mut wildcard_suffixes = Vec::new();
        for h in &route.hosts {
            let h = h.to_ascii_lowercase();
            if let Some(stripped) = h.strip_prefix('*') {
                wildcard_suffixes.push(stripped.to_string());
            } else {
                exact.push(h);
            }
        }
        Self {
            exact,
            wildcard_suffixes,
        }
    }

    #[inline(always)]
    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard_suffixes.is_empty()
    }

    /// Check the given request host (lowercased, port already stripped).
    #[inline]
    fn matches(&self, request_host: Option<&str>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(host) = request_host else {
            return false;
        };
        if self.exact.iter().any(|h| h == host) {
            return true;
        }
        self.wildcard_suffixes
            .iter()
            .any(|suffix| host.len() > suffix.len() && host.ends_with(suffix.as_str()))
    }
}

/// Path-rule specificity rank: exact > regex > prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum PathKind {
    Prefix = 0,
    Regex = 1,
    Exact = 2,
}

/// Reference from an index entry back to its candidate route.
#[derive(Clone, Copy, Debug)]
struct RuleRef {
    cand: usize,
    kind: PathKind,
    literal_len: usize,
}

struct Candidate {
    route: Arc<Route>,
    host: HostConstraint,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    rules: Vec<RuleRef>,
}

impl TrieNode {
    fn insert(&mut self, segments: &[&str], rule: RuleRef) {
        match segments.split_first() {
            None => self.rules.push(rule),
            Some((head, rest)) => self
                .children
                .entry(head.to_string())
                .or_default()
                .insert(rest, rule),
        }
    }
}

/// Compiled routing table: an exact-path map, a segment prefix trie, and
/// an ordered regex list.
pub struct CompiledRouter {
    candidates: Vec<Candidate>,
    exact: HashMap<String, Vec<RuleRef>>,
    trie: TrieNode,
    regexes: Vec<(regex::Regex, RuleRef)>,
}

impl CompiledRouter {
    fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            exact: HashMap::new(),
            trie: TrieNode::default(),
            regexes: Vec::new(),
        }
    }

    /// Compile the active routes of a snapshot.
    ///
    /// An invalid regex rejects the build; the caller must keep serving the
    /// previous table.
    pub fn build(snapshot: &ConfigSnapshot) -> Result<Self, GatewayError> {
        let mut compiled = Self::empty();

        // Priority-descending build order keeps the regex list evaluation
        // order aligned with selection precedence.
        let mut routes: Vec<&Arc<Route>> =
            snapshot.routes.iter().filter(|r| r.enabled).collect();
        routes.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        for route in routes {
            let cand = compiled.candidates.len();
            compiled.candidates.push(Candidate {
                route: Arc::clone(route),
                host: HostConstraint::from_route(route),
            });

            for rule in &route.paths {
                match rule {
                    PathRule::Exact(path) => {
                        compiled.exact.entry(path.clone()).or_default().push(RuleRef {
                            cand,
                            kind: PathKind::Exact,
                            literal_len: path.len(),
                        });
                    }
                    PathRule::Prefix(prefix) => {
                        let segments: Vec<&str> =
                            prefix.split('/').filter(|s| !s.is_empty()).collect();
                        compiled.trie.insert(
                            &segments,
                            RuleRef {
                                cand,
                                kind: PathKind::Prefix,
                                literal_len: prefix.trim_end_matches('/').len(),
                            },
                        );
                    }
                    PathRule::Regex(pattern) => {
                        let re = regex::Regex::new(pattern).map_err(|e| {
                            GatewayError::ConfigInvalid(format!(
                                "route {} regex '{}': {}",
                                route.id, pattern, e
                            ))
                        })?;
                        compiled.regexes.push((
                            re,
                            RuleRef {
                                cand,
                                kind: PathKind::Regex,
                                literal_len: 0,
                            },
                        ));
                    }
                }
            }
        }

        Ok(compiled)
    }

    /// Collect every path-rule hit for the request path.
    fn path_hits(&self, path: &str) -> Vec<RuleRef> {
        let mut hits = Vec::new();

        if let Some(rules) = self.exact.get(path) {
            hits.extend_from_slice(rules);
        }

        // Prefix candidates are collected along the whole trie walk; the
        // longest-literal-prefix tie-break orders competing rules.
        let mut node = &self.trie;
        hits.extend_from_slice(&node.rules);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    hits.extend_from_slice(&node.rules);
                }
                None => break,
            }
        }

        for (re, rule) in &self.regexes {
            if re.is_match(path) {
                hits.push(*rule);
            }
        }

        hits
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::new(Arc::new(CompiledRouter::empty())),
            version: AtomicU64::new(0),
        }
    }

    /// Returns the current route table version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Swap in a freshly compiled table (snapshot publish).
    pub fn reload(&self, compiled: CompiledRouter) {
        let count = compiled.candidates.len();
        self.inner.store(Arc::new(compiled));
        self.version.fetch_add(1, Ordering::Release);
        info!(routes = count, "Router reloaded");
    }

    /// Match a request against the active table.
    ///
    /// `path` must already be percent-decoded (see [`percent_decode_path`]);
    /// `host` is the raw Host header. Returns the unique highest-priority
    /// match: priority desc, then exact > regex > prefix, then longest
    /// literal prefix, then lexicographically smallest route id.
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
        host: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Option<Arc<Route>> {
        let compiled = self.inner.load();

        let host = host.map(|h| {
            let h = h.split(':').next().unwrap_or(h);
            h.to_ascii_lowercase()
        });
        let host = host.as_deref();

        let mut best: Option<RuleRef> = None;
        for hit in compiled.path_hits(path) {
            let candidate = &compiled.candidates[hit.cand];
            if !candidate.host.matches(host) {
                continue;
            }
            if !candidate.route.method_allowed(method) {
                continue;
            }
            if !candidate.route.headers.iter().all(|p| p.matches(headers)) {
                continue;
            }
            best = Some(match best {
                None => hit,
                Some(current) => {
                    if wins(&compiled.candidates, hit, current) {
                        hit
                    } else {
                        current
                    }
                }
            });
        }

        best.map(|r| Arc::clone(&compiled.candidates[r.cand].route))
    }
}

/// Match precedence: does `a` beat `b`?
fn wins(candidates: &[Candidate], a: RuleRef, b: RuleRef) -> bool {
    let ra = &candidates[a.cand].route;
    let rb = &candidates[b.cand].route;
    (ra.priority, a.kind, a.literal_len, std::cmp::Reverse(ra.id.as_str()))
        > (rb.priority, b.kind, b.literal_len, std::cmp::Reverse(rb.id.as_str()))
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Percent-decode a request path. Invalid escape sequences pass through
/// untouched; `+` is not treated as a space.
pub fn percent_decode_path(path: &str) -> Cow<'_, str> {
    if !path.contains('%') {
        return Cow::Borrowed(path);
    }
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}
