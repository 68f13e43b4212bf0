//! kcopy resolve: turn `[group/][version/]resource` tokens into resolved coordinates.
//!
//! Resolution runs against a registry snapshot (the output of `ApiSurface::discover`) and
//! never leaves group/version ambiguous. Tokens that only name a resource default to the core
//! group; non-core groups are consulted only when the core group does not serve the resource.

#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};

use kcopy_core::{CopyError, CopyOutcome, DiscoveredResource, ResolvedResource, ResourceCoordinate};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::debug;

static SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9.]*[A-Za-z0-9])?$").expect("segment regex"));

/// A parsed but unresolved token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenParts<'a> {
    pub group: Option<&'a str>,
    pub version: Option<&'a str>,
    pub resource: &'a str,
}

pub fn parse_token(token: &str) -> CopyOutcome<TokenParts<'_>> {
    let invalid = || CopyError::InvalidResourceToken(token.to_string());
    let parts: Vec<&str> = token.trim().split('/').collect();
    if parts.iter().any(|p| !SEGMENT.is_match(p)) {
        return Err(invalid());
    }
    match parts.as_slice() {
        [resource] => Ok(TokenParts { group: None, version: None, resource }),
        [version, resource] => Ok(TokenParts { group: None, version: Some(version), resource }),
        [group, version, resource] => Ok(TokenParts { group: Some(group), version: Some(version), resource }),
        _ => Err(invalid()),
    }
}

fn matches_resource(d: &DiscoveredResource, name: &str) -> bool {
    d.resource.eq_ignore_ascii_case(name) || d.kind.eq_ignore_ascii_case(name)
}

/// Resolves tokens against a registry snapshot; results are cached per token.
pub struct Resolver {
    registry: Vec<DiscoveredResource>,
    cache: Mutex<FxHashMap<String, ResolvedResource>>,
}

impl Resolver {
    pub fn new(registry: Vec<DiscoveredResource>) -> Self {
        Self { registry, cache: Mutex::new(FxHashMap::default()) }
    }

    pub fn registry(&self) -> &[DiscoveredResource] { &self.registry }

    pub fn resolve(&self, token: &str) -> CopyOutcome<ResolvedResource> {
        if let Some(hit) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(token) {
            return Ok(hit.clone());
        }
        let parts = parse_token(token)?;
        let resolved = self.resolve_parts(token, &parts)?;
        debug!(token, coordinate = %resolved.coordinate, kind = %resolved.kind, "resolved resource token");
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Find the registry entry for an already complete coordinate.
    pub fn lookup(&self, coordinate: &ResourceCoordinate) -> Option<ResolvedResource> {
        self.registry
            .iter()
            .find(|d| d.group == coordinate.group && d.version == coordinate.version && d.resource == coordinate.resource)
            .map(ResolvedResource::from)
    }

    fn resolve_parts(&self, token: &str, parts: &TokenParts<'_>) -> CopyOutcome<ResolvedResource> {
        if let (Some(group), Some(version)) = (parts.group, parts.version) {
            return self
                .registry
                .iter()
                .find(|d| d.group == group && d.version == version && matches_resource(d, parts.resource))
                .map(ResolvedResource::from)
                .ok_or_else(|| CopyError::UnknownResource(token.to_string()));
        }
        let candidates: Vec<&DiscoveredResource> = self
            .registry
            .iter()
            .filter(|d| matches_resource(d, parts.resource))
            .filter(|d| parts.version.map_or(true, |v| d.version == v))
            .collect();
        select(token, candidates)
    }
}

/// Pick one entry per group (preferred version first), then prefer the core group.
fn select(token: &str, candidates: Vec<&DiscoveredResource>) -> CopyOutcome<ResolvedResource> {
    let mut per_group: Vec<&DiscoveredResource> = Vec::new();
    for d in candidates {
        match per_group.iter_mut().find(|c| c.group == d.group) {
            Some(slot) => {
                if d.preferred && !slot.preferred {
                    *slot = d;
                }
            }
            None => per_group.push(d),
        }
    }
    if let Some(core) = per_group.iter().find(|d| d.group.is_empty()) {
        return Ok(ResolvedResource::from(*core));
    }
    match per_group.as_slice() {
        [] => Err(CopyError::UnknownResource(token.to_string())),
        [only] => Ok(ResolvedResource::from(*only)),
        many => {
            let mut names: Vec<String> = many.iter().map(|d| d.coordinate().to_string()).collect();
            names.sort();
            Err(CopyError::AmbiguousResource { token: token.to_string(), candidates: names })
        }
    }
}
