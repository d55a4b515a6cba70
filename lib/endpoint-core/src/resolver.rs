//! Rule resolution: inbound `(path, method)` to a bound handler

use crate::cache::RegistrySnapshot;
use crate::handler::{EndpointHandler, EndpointRequest, EndpointResponse, HandlerCall, HandlerError, HandlerRegistry};
use crate::pattern::{split_path, Converter, PathValue, RoutePattern, Segment};
use crate::response_cache::{CachedHandler, ResponseCache};
use crate::HandlerResolutionError;
use endpoint_api::{RequestMethod, Rule, RoutingMetadata};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::warn;

type ResolvedHandler = Result<Arc<dyn EndpointHandler>, HandlerResolutionError>;

struct RuleSlot {
    rule: Rule,
    // resolved once per snapshot, on first dispatch
    handler: OnceLock<ResolvedHandler>,
}

struct ParamEdge {
    name: String,
    converter: Converter,
    node: Node,
}

#[derive(Default)]
struct Node {
    statics: HashMap<String, Node>,
    params: Vec<ParamEdge>,
    rest: Vec<(String, usize)>,
    terminal: Vec<usize>,
}

type Captures<'t> = Vec<(&'t str, PathValue)>;

impl Node {
    fn insert(&mut self, segments: &[Segment], slot: usize) {
        match segments.split_first() {
            None => self.terminal.push(slot),
            Some((Segment::Static(text), rest)) => {
                self.statics.entry(text.clone()).or_default().insert(rest, slot)
            }
            Some((Segment::Param { name, converter: Converter::Path }, _)) => {
                self.rest.push((name.clone(), slot))
            }
            Some((Segment::Param { name, converter }, rest)) => {
                let existing = self
                    .params
                    .iter()
                    .position(|e| e.name == *name && e.converter == *converter);
                let index = match existing {
                    Some(index) => index,
                    None => {
                        // keep edges ordered from most to least specific
                        let at = self
                            .params
                            .partition_point(|e| e.converter.rank() <= converter.rank());
                        self.params.insert(
                            at,
                            ParamEdge {
                                name: name.clone(),
                                converter: *converter,
                                node: Node::default(),
                            },
                        );
                        at
                    }
                };
                self.params[index].node.insert(rest, slot)
            }
        }
    }

    /// Collect every slot matching `segments`, static edges first
    fn collect<'t>(&'t self, segments: &[&str], captures: &mut Captures<'t>, out: &mut Vec<(usize, Captures<'t>)>) {
        let Some((head, tail)) = segments.split_first() else {
            out.extend(self.terminal.iter().map(|&slot| (slot, captures.clone())));
            return;
        };

        if let Some(child) = self.statics.get(*head) {
            child.collect(tail, captures, out);
        }

        for edge in &self.params {
            if let Some(value) = edge.converter.convert(head) {
                captures.push((edge.name.as_str(), value));
                edge.node.collect(tail, captures, out);
                captures.pop();
            }
        }

        for (name, slot) in &self.rest {
            captures.push((name.as_str(), PathValue::Path(segments.join("/"))));
            out.push((*slot, captures.clone()));
            captures.pop();
        }
    }
}

/// Outcome of matching a path against a [`RouteTable`]
enum TableMatch<'t> {
    Found { slot: &'t RuleSlot, captures: Captures<'t> },
    MethodNotAllowed(Vec<RequestMethod>),
    NotFound,
}

/// Segment trie over every route of a snapshot
pub struct RouteTable {
    root: Node,
    slots: Vec<RuleSlot>,
}

impl RouteTable {
    pub fn build<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Self {
        let mut table = RouteTable {
            root: Node::default(),
            slots: Vec::new(),
        };

        for rule in rules {
            let slot = table.slots.len();
            let mut inserted = false;
            for route in routes_of(rule) {
                match RoutePattern::parse(route) {
                    Ok(pattern) => {
                        table.root.insert(pattern.segments(), slot);
                        inserted = true;
                    }
                    Err(e) => warn!(key = %rule.key, route, error = %e, "Skipping invalid route pattern"),
                }
            }
            if inserted {
                table.slots.push(RuleSlot {
                    rule: rule.clone(),
                    handler: OnceLock::new(),
                });
            }
        }

        table
    }

    /// Number of rules reachable through the table
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn lookup(&self, path: &str, method: &str) -> TableMatch<'_> {
        let segments: Vec<&str> = split_path(path).collect();
        let mut candidates = Vec::new();
        self.root.collect(&segments, &mut Vec::new(), &mut candidates);

        if candidates.is_empty() {
            return TableMatch::NotFound;
        }

        let mut allowed = Vec::new();
        for (slot, captures) in candidates {
            let slot = &self.slots[slot];
            if slot.rule.routing.allows(method) {
                return TableMatch::Found { slot, captures };
            }
            allowed.extend(slot.rule.routing.methods.iter().copied());
        }
        allowed.sort();
        allowed.dedup();
        TableMatch::MethodNotAllowed(allowed)
    }
}

fn routes_of(rule: &Rule) -> Vec<&str> {
    if rule.routing.routes.is_empty() {
        vec![rule.route.as_str()]
    } else {
        rule.routing.routes.iter().map(String::as_str).collect()
    }
}

/// A matched rule bound to its handler, default arguments and path captures
#[derive(Clone)]
pub struct BoundHandler {
    key: String,
    routing: RoutingMetadata,
    handler: Arc<dyn EndpointHandler>,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    captures: Vec<(String, PathValue)>,
}

impl BoundHandler {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn routing(&self) -> &RoutingMetadata {
        &self.routing
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn captures(&self) -> &[(String, PathValue)] {
        &self.captures
    }

    pub fn capture(&self, name: &str) -> Option<&PathValue> {
        self.captures.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Call the handler; path captures override default keyword arguments
    pub async fn invoke(&self, request: EndpointRequest) -> Result<EndpointResponse, HandlerError> {
        let mut kwargs = self.kwargs.clone();
        for (name, value) in &self.captures {
            kwargs.insert(name.clone(), value.to_json());
        }
        self.handler
            .call(HandlerCall {
                args: self.args.clone(),
                kwargs,
                request,
            })
            .await
    }
}

impl fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundHandler")
            .field("key", &self.key)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("captures", &self.captures)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Resolution {
    Matched(BoundHandler),
    NotFound,
    MethodNotAllowed { allowed: Vec<RequestMethod> },
}

/// Resolves requests against registry snapshots.
///
/// Handler descriptors are resolved lazily and memoized inside the snapshot,
/// so use one resolver (one handler registry) per cache.
#[derive(Clone)]
pub struct RuleResolver {
    handlers: Arc<HandlerRegistry>,
    responses: Option<Arc<ResponseCache>>,
}

impl RuleResolver {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            handlers,
            responses: None,
        }
    }

    /// Serve rules carrying a cache policy through `cache`
    pub fn with_response_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.responses = Some(cache);
        self
    }

    pub fn response_cache(&self) -> Option<&Arc<ResponseCache>> {
        self.responses.as_ref()
    }

    fn bind(&self, rule: &Rule) -> ResolvedHandler {
        let handler = self.handlers.lookup(&rule.handler)?;
        Ok(match (&self.responses, rule.routing.cache_policy) {
            (Some(cache), Some(policy)) => {
                Arc::new(CachedHandler::new(handler, cache.clone(), rule.key.clone(), policy))
            }
            _ => handler,
        })
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn resolve(
        &self,
        snapshot: &RegistrySnapshot,
        path: &str,
        method: &str,
    ) -> Result<Resolution, HandlerResolutionError> {
        let (slot, captures) = match snapshot.route_table().lookup(path, method) {
            TableMatch::NotFound => return Ok(Resolution::NotFound),
            TableMatch::MethodNotAllowed(allowed) => return Ok(Resolution::MethodNotAllowed { allowed }),
            TableMatch::Found { slot, captures } => (slot, captures),
        };

        let handler = slot
            .handler
            .get_or_init(|| self.bind(&slot.rule))
            .clone()?;

        let rule = &slot.rule;
        Ok(Resolution::Matched(BoundHandler {
            key: rule.key.clone(),
            routing: rule.routing.clone(),
            handler,
            args: rule.handler.default_args.clone(),
            kwargs: rule.handler.default_kwargs.clone(),
            captures: captures
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }))
    }

    /// Resolve a rule's handler eagerly, for registration-time checks
    pub fn check(&self, rule: &Rule) -> Result<(), HandlerResolutionError> {
        self.handlers.lookup(&rule.handler).map(|_| ())
    }
}
