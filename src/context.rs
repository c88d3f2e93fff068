//! Mutable per-request execution state
//!
//! A [`VclContext`] is built per request and discarded afterwards; nothing in
//! it is shared between requests. Phase rules are enforced by the evaluator
//! with a single policy: **writes to fields that are read-only in the current
//! phase are silent no-ops**, and reads of `obj` outside the hit/error phases
//! yield null. Headers with an empty value are considered unset.

use crate::ast::{Acl, BackendDecl, DirectorDecl, DirectorKind, Program, TableValue};
use indexmap::IndexMap;
use std::net::Ipv4Addr;

/// Ordered header map: case-preserving names, case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: IndexMap<String, String>,
}

impl Headers {
    /// Creates an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a header; absent headers read as the empty string
    pub fn get(&self, name: &str) -> &str {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// True when a header is present with a non-empty value
    pub fn contains(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }

    /// Writes a header, keeping the first-seen name casing.
    /// An empty value unsets the header.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.remove(name);
            return;
        }
        let existing = self
            .entries
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned();
        match existing {
            Some(key) => {
                self.entries.insert(key, value);
            }
            None => {
                self.entries.insert(name.to_string(), value);
            }
        }
    }

    /// Removes a header
    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|k, _| !k.eq_ignore_ascii_case(name));
    }

    /// Iterates headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of set headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no headers are set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Request phases a subroutine can run in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Recv,
    Hash,
    Hit,
    Miss,
    Pass,
    Fetch,
    Deliver,
    Error,
    Log,
}

impl Phase {
    /// Maps a subroutine name to its phase; unknown names run as Recv
    pub fn for_subroutine(name: &str) -> Self {
        match name {
            "vcl_recv" => Phase::Recv,
            "vcl_hash" => Phase::Hash,
            "vcl_hit" => Phase::Hit,
            "vcl_miss" => Phase::Miss,
            "vcl_pass" => Phase::Pass,
            "vcl_fetch" => Phase::Fetch,
            "vcl_deliver" => Phase::Deliver,
            "vcl_error" => Phase::Error,
            "vcl_log" => Phase::Log,
            _ => Phase::Recv,
        }
    }
}

/// Client request state (`req.*`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    /// Request URL including query string
    pub url: String,
    /// HTTP method
    pub method: String,
    /// Request headers
    pub http: Headers,
    /// Name of the backend selected for this request
    pub backend: String,
}

/// Backend request state (`bereq.*`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendRequest {
    /// URL sent upstream
    pub url: String,
    /// Method sent upstream
    pub method: String,
    /// Headers sent upstream
    pub http: Headers,
}

/// Backend response state (`beresp.*`), mutable only in the fetch phase
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendResponse {
    /// Upstream status code
    pub status: i64,
    /// Upstream headers
    pub http: Headers,
    /// Cache lifetime in seconds
    pub ttl: f64,
}

/// Client response state (`resp.*`), mutable only in the deliver phase
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// Status code sent to the client
    pub status: i64,
    /// Response headers
    pub http: Headers,
    /// Response body (synthetic bodies land here during deliver)
    pub body: String,
}

/// Cached object state (`obj.*`), readable in the hit and error phases
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedObject {
    /// Object status code; `error` statements write this
    pub status: i64,
    /// Object response text / synthetic body
    pub response: String,
    /// Number of cache hits recorded on the object
    pub hits: i64,
    /// Object headers
    pub http: Headers,
    /// Remaining lifetime in seconds
    pub ttl: f64,
}

/// Client connection info (`client.*`)
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    /// Peer address text
    pub ip: String,
    /// Optional client identity; falls back to the IP for hashing directors
    pub identity: Option<String>,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            identity: None,
        }
    }
}

/// Mutable execution context for one request
#[derive(Debug, Clone)]
pub struct VclContext {
    /// Client request
    pub req: Request,
    /// Backend request
    pub bereq: BackendRequest,
    /// Backend response
    pub beresp: BackendResponse,
    /// Client response
    pub resp: Response,
    /// Cached object
    pub obj: CachedObject,
    /// Client connection
    pub client: Client,
    /// 24-char hex time token (8 hex chars of epoch seconds + entropy)
    pub time_hex: String,
    /// Named tables, seeded from declarations and mutable via `std.table.*`
    pub tables: IndexMap<String, IndexMap<String, TableValue>>,
    /// ACL registry
    pub acls: IndexMap<String, Acl>,
    /// Backend registry
    pub backends: IndexMap<String, BackendDecl>,
    /// Director registry; members resolve against `backends` by name
    pub directors: IndexMap<String, DirectorDecl>,
    /// `var.*` locals of the currently executing subroutine
    pub vars: IndexMap<String, crate::value::Value>,
    /// Accumulated `hash_data` fragments
    pub hash_data: Vec<String>,
    /// `log` statement output, in execution order
    pub logs: Vec<String>,
    /// Last error message, readable as `fastly.error`
    pub fastly_error: Option<String>,
    /// Current phase
    pub phase: Phase,
    /// Restarts performed so far
    pub restarts: u32,
    /// Restart ceiling before the driver bails out
    pub max_restarts: u32,
}

impl Default for VclContext {
    fn default() -> Self {
        Self::new()
    }
}

impl VclContext {
    /// Creates a fresh context with empty registries
    pub fn new() -> Self {
        Self {
            req: Request {
                url: "/".to_string(),
                method: "GET".to_string(),
                http: Headers::new(),
                backend: "default".to_string(),
            },
            bereq: BackendRequest::default(),
            beresp: BackendResponse::default(),
            resp: Response::default(),
            obj: CachedObject::default(),
            client: Client::default(),
            time_hex: String::new(),
            tables: IndexMap::new(),
            acls: IndexMap::new(),
            backends: IndexMap::new(),
            directors: IndexMap::new(),
            vars: IndexMap::new(),
            hash_data: Vec::new(),
            logs: Vec::new(),
            fastly_error: None,
            phase: Phase::Recv,
            restarts: 0,
            max_restarts: 3,
        }
    }

    /// Seeds registries from a parsed program without clobbering entries
    /// already present (table mutations made earlier in the request survive)
    pub fn adopt_declarations(&mut self, program: &Program) {
        for acl in &program.acls {
            if !self.acls.contains_key(&acl.name) {
                self.acls.insert(acl.name.clone(), acl.clone());
            }
        }
        for table in &program.tables {
            if !self.tables.contains_key(&table.name) {
                self.tables
                    .insert(table.name.clone(), table.entries.iter().cloned().collect());
            }
        }
        for backend in &program.backends {
            if !self.backends.contains_key(&backend.name) {
                self.backends.insert(backend.name.clone(), backend.clone());
            }
        }
        for director in &program.directors {
            if !self.directors.contains_key(&director.name) {
                self.directors.insert(director.name.clone(), director.clone());
            }
        }
    }

    /// Tests client membership in a named ACL
    ///
    /// IPv4 entries may carry a CIDR prefix; matching is bitwise on the high
    /// `subnet` bits. Negated entries take precedence: a negated match
    /// rejects regardless of other entries.
    pub fn acl_matches(&self, acl_name: &str, ip_text: &str) -> bool {
        let Some(acl) = self.acls.get(acl_name) else {
            return false;
        };
        let Ok(ip) = ip_text.parse::<Ipv4Addr>() else {
            return false;
        };
        acl_contains(acl, ip)
    }

    /// The joined hash key built by `vcl_hash`
    pub fn hash_key(&self) -> String {
        self.hash_data.join("/")
    }

    /// Resets per-subroutine local variables
    pub fn clear_locals(&mut self) {
        self.vars.clear();
    }

    /// True when `obj.*` may be read in the current phase
    pub fn obj_readable(&self) -> bool {
        matches!(self.phase, Phase::Hit | Phase::Error | Phase::Deliver)
    }

    /// Resolves a backend or director name to a concrete backend name
    ///
    /// Directors pick a member by their policy: `random` draws weighted,
    /// `client` hashes the client identity, `hash` takes the request hash
    /// key modulo the member list, `chash` places the hash key on a
    /// consistent-hash ring of member points, `fallback` takes the first
    /// member whose backend is registered. Names that match neither
    /// registry come back unchanged.
    pub fn pick_backend(&self, name: &str) -> String {
        if self.backends.contains_key(name) {
            return name.to_string();
        }
        let Some(director) = self.directors.get(name) else {
            return name.to_string();
        };
        if director.backends.is_empty() {
            return name.to_string();
        }
        match director.kind {
            DirectorKind::Random => {
                let total: i64 = director.backends.iter().map(|b| b.weight.max(1)).sum();
                let mut draw = rand::Rng::gen_range(&mut rand::thread_rng(), 0..total.max(1));
                for member in &director.backends {
                    draw -= member.weight.max(1);
                    if draw < 0 {
                        return member.name.clone();
                    }
                }
                director.backends[0].name.clone()
            }
            DirectorKind::Fallback => director
                .backends
                .iter()
                .find(|b| self.backends.contains_key(&b.name))
                .unwrap_or(&director.backends[0])
                .name
                .clone(),
            DirectorKind::Client => {
                let key = self.client.identity.as_deref().unwrap_or(&self.client.ip);
                self.pick_by_hash(director, key)
            }
            DirectorKind::Hash => {
                let key = self.hash_key();
                self.pick_by_hash(director, &key)
            }
            DirectorKind::Chash => {
                let key = self.hash_key();
                self.pick_by_ring(director, &key)
            }
        }
    }

    /// Plain modulo placement; a membership change may remap every key
    fn pick_by_hash(&self, director: &DirectorDecl, key: &str) -> String {
        let idx = (hash_point(key) % director.backends.len() as u64) as usize;
        director.backends[idx].name.clone()
    }

    /// Consistent-hash placement for `chash` directors
    ///
    /// Each member owns weight-scaled virtual points on a ring; a key maps
    /// to the first point at or after its own hash, wrapping. Removing a
    /// member only remaps the keys that pointed at it.
    fn pick_by_ring(&self, director: &DirectorDecl, key: &str) -> String {
        let mut ring: Vec<(u64, &str)> = Vec::new();
        for member in &director.backends {
            let replicas = member.weight.max(1) as usize * RING_POINTS_PER_WEIGHT;
            for replica in 0..replicas {
                let point = hash_point(&format!("{}#{replica}", member.name));
                ring.push((point, member.name.as_str()));
            }
        }
        ring.sort_unstable();
        let wanted = hash_point(key);
        let idx = ring.partition_point(|(point, _)| *point < wanted);
        let (_, name) = ring[idx % ring.len()];
        name.to_string()
    }

    /// True when the given root object is writable in the current phase
    pub fn writable(&self, root: &str) -> bool {
        match root {
            "beresp" => self.phase == Phase::Fetch,
            "resp" => matches!(self.phase, Phase::Deliver | Phase::Error),
            "obj" => matches!(self.phase, Phase::Hit | Phase::Error),
            _ => true,
        }
    }
}

/// Virtual ring points per unit of member weight
const RING_POINTS_PER_WEIGHT: usize = 16;

fn hash_point(value: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Bitwise IPv4 CIDR membership for one ACL
fn acl_contains(acl: &Acl, ip: Ipv4Addr) -> bool {
    let ip_bits = u32::from(ip);
    let mut matched = false;
    for entry in &acl.entries {
        let Ok(entry_ip) = entry.ip.parse::<Ipv4Addr>() else {
            continue;
        };
        let bits = entry.subnet.unwrap_or(32).min(32) as u32;
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        if (ip_bits & mask) == (u32::from(entry_ip) & mask) {
            if entry.negated {
                return false;
            }
            matched = true;
        }
    }
    matched
}
