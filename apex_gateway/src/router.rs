//! Route table: loads `routes.yaml`, sorts by specificity, and matches an
//! inbound method + path to a [`Route`], extracting path parameters.
//!
//! Pattern dialect, most to least specific:
//!   - literal segments (`/users`)
//!   - named parameters (`{id}`)
//!   - single-segment wildcard (`*`)
//!   - multi-segment wildcard (`**`), must be the last segment
//!
//! A trailing slash on either the configured pattern or the request path is
//! tolerated and does not affect matching.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
  pub pattern: String,
  pub methods: Vec<String>,
  pub service: String,
  #[serde(default)]
  pub strip_prefix: Option<String>,
  /// Replaces the matched path outright before forwarding; takes
  /// precedence over `strip_prefix` when both are set. `{name}` path
  /// parameters captured by the pattern may be referenced in the
  /// template, e.g. `/v2/users/{id}`.
  #[serde(default)]
  pub rewrite_path: Option<String>,
  #[serde(default)]
  pub auth_required: bool,
  #[serde(default)]
  pub rate_limit_override: Option<u64>,
  /// Overrides `server.request_timeout_secs` for calls to this route's
  /// service.
  #[serde(default)]
  pub timeout_secs: Option<u64>,
  /// Extra headers merged onto the outbound request, on top of the
  /// synthesized identity/tracing headers. Route-configured values win
  /// over anything the gateway would otherwise set.
  #[serde(default)]
  pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Specificity {
  Exact,
  Parameterized,
  Wildcard,
}

struct CompiledRoute {
  route: Route,
  segments: Vec<Segment>,
  specificity: Specificity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
  Literal(String),
  Param(String),
  SingleWildcard,
  MultiWildcard,
}

fn compile_segments(pattern: &str) -> Vec<Segment> {
  pattern
    .trim_end_matches('/')
    .split('/')
    .filter(|s| !s.is_empty())
    .map(|s| {
      if s == "**" {
        Segment::MultiWildcard
      } else if s == "*" {
        Segment::SingleWildcard
      } else if let Some(name) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        Segment::Param(name.to_string())
      } else {
        Segment::Literal(s.to_string())
      }
    })
    .collect()
}

fn specificity_of(segments: &[Segment]) -> Specificity {
  if segments.iter().any(|s| matches!(s, Segment::MultiWildcard | Segment::SingleWildcard)) {
    Specificity::Wildcard
  } else if segments.iter().any(|s| matches!(s, Segment::Param(_))) {
    Specificity::Parameterized
  } else {
    Specificity::Exact
  }
}

pub struct RouteMatch<'a> {
  pub route: &'a Route,
  pub params: HashMap<String, String>,
}

pub struct Router {
  routes: Vec<CompiledRoute>,
}

impl Router {
  pub fn from_file(path: &str) -> Result<Self> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let routes: Vec<Route> =
      serde_yaml::from_str(&content).with_context(|| format!("parsing {path}"))?;
    Self::from_routes(routes)
  }

  pub fn from_routes(routes: Vec<Route>) -> Result<Self> {
    let mut compiled: Vec<CompiledRoute> = routes
      .into_iter()
      .map(|route| {
        let segments = compile_segments(&route.pattern);
        let specificity = specificity_of(&segments);
        CompiledRoute { route, segments, specificity }
      })
      .collect();

    for c in &compiled {
      if let Some(pos) = c.segments.iter().position(|s| matches!(s, Segment::MultiWildcard)) {
        if pos != c.segments.len() - 1 {
          bail!("`**` must be the last segment in pattern {}", c.route.pattern);
        }
      }
    }

    // Exact beats parameterized beats wildcard; among equals, more
    // segments wins; remaining ties keep insertion order (`sort_by` is
    // stable).
    compiled.sort_by(|a, b| a.specificity.cmp(&b.specificity).then(b.segments.len().cmp(&a.segments.len())));
    Ok(Self { routes: compiled })
  }

  /// Reload the route table from disk in place; returns the new table so
  /// callers can swap it in behind an `ArcSwap`/`RwLock` atomically.
  pub fn reload(path: &str) -> Result<Self> {
    Self::from_file(path)
  }

  /// Distinct service names referenced by the route table, used to know
  /// which services a polling discovery backend needs to track.
  pub fn service_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.routes.iter().map(|c| c.route.service.clone()).collect();
    names.sort();
    names.dedup();
    names
  }

  /// A request path's trailing slash is tolerated either way against a
  /// literal or parameterized pattern's own trailing slash (§3: "equal or
  /// `path + \"/\"` prefix", narrowed to a single tolerated trailing slash
  /// per DESIGN.md) — segments are compared with trailing slashes trimmed
  /// from both sides, so `/api/users` and `/api/users/` match the same
  /// route regardless of which form the pattern was written in.
  pub fn find(&self, method: &str, path: &str) -> Option<RouteMatch<'_>> {
    let request_segments: Vec<&str> = path
      .trim_end_matches('/')
      .split('/')
      .filter(|s| !s.is_empty())
      .collect();

    for compiled in &self.routes {
      if !compiled
        .route
        .methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
      {
        continue;
      }

      if let Some(params) = match_segments(&compiled.segments, &request_segments) {
        return Some(RouteMatch { route: &compiled.route, params });
      }
    }
    None
  }
}

fn match_segments(pattern: &[Segment], request: &[&str]) -> Option<HashMap<String, String>> {
  let mut params = HashMap::new();
  let mut pi = 0;
  let mut ri = 0;

  while pi < pattern.len() {
    match &pattern[pi] {
      Segment::MultiWildcard => return Some(params),
      Segment::Literal(lit) => {
        if request.get(ri) != Some(&lit.as_str()) {
          return None;
        }
        ri += 1;
      }
      Segment::Param(name) => {
        let value = request.get(ri)?;
        params.insert(name.clone(), value.to_string());
        ri += 1;
      }
      Segment::SingleWildcard => {
        request.get(ri)?;
        ri += 1;
      }
    }
    pi += 1;
  }

  if ri == request.len() { Some(params) } else { None }
}
