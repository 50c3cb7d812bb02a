//! Trie construction and the frozen, shareable node representation.
//!
//! Registration mutates [`BuildNode`]s through a single exclusive owner. At
//! finalize the tree is frozen into [`Node`]s (string keys interned into the
//! cache arena, static children sorted for lookup, parameter children ranked
//! narrowest-type-first) and from then on it is immutable, shared by
//! reference with every worker.

use riptide_core::memory::{self, AllocationExhausted};

use super::{
    pattern::{ParamType, Pattern, Segment},
    RouteError,
};
use crate::http::method::{HttpMethod, MethodSet};

#[derive(Default)]
pub(crate) struct BuildNode {
    static_children: Vec<(String, BuildNode)>,
    param_children: Vec<BuildParam>,
    tail_children: Vec<BuildTail>,
    routes: Vec<(HttpMethod, u32)>,
}

struct BuildParam {
    name: String,
    ty: ParamType,
    node: BuildNode,
}

enum BuildTail {
    Param { name: String, node: BuildNode },
    Wildcard(BuildNode),
}

impl BuildNode {
    /// Walk the pattern, creating nodes as needed, and attach the route at
    /// the terminal under its method.
    pub(crate) fn insert(
        &mut self,
        pattern: &Pattern,
        method: HttpMethod,
        id: u32,
    ) -> Result<(), RouteError> {
        let mut node = self;
        for segment in &pattern.segments {
            node = match segment {
                Segment::Static(lit) => node.static_child(lit),
                Segment::Param { name, ty } if *ty == ParamType::PathRest => {
                    node.tail_param(name, &pattern.raw)?
                }
                Segment::Param { name, ty } => node.param_child(name, *ty, &pattern.raw)?,
                Segment::Wildcard => node.tail_wildcard(),
            };
        }
        if node.routes.iter().any(|(m, _)| *m == method) {
            return Err(RouteError::Conflict {
                method,
                pattern: pattern.raw.clone(),
            });
        }
        node.routes.push((method, id));
        Ok(())
    }

    fn static_child(&mut self, lit: &str) -> &mut BuildNode {
        if let Some(idx) = self.static_children.iter().position(|(k, _)| k == lit) {
            return &mut self.static_children[idx].1;
        }
        self.static_children
            .push((lit.to_string(), BuildNode::default()));
        &mut self.static_children.last_mut().unwrap().1
    }

    /// At most one parameter child per type; a second registration with the
    /// same type must also use the same name.
    fn param_child(
        &mut self,
        name: &str,
        ty: ParamType,
        pattern: &str,
    ) -> Result<&mut BuildNode, RouteError> {
        if let Some(idx) = self.param_children.iter().position(|p| p.ty == ty) {
            if self.param_children[idx].name != name {
                return Err(RouteError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "conflicting parameter name at the same position",
                });
            }
            return Ok(&mut self.param_children[idx].node);
        }
        self.param_children.push(BuildParam {
            name: name.to_string(),
            ty,
            node: BuildNode::default(),
        });
        Ok(&mut self.param_children.last_mut().unwrap().node)
    }

    fn tail_param(&mut self, name: &str, pattern: &str) -> Result<&mut BuildNode, RouteError> {
        if let Some(idx) = self
            .tail_children
            .iter()
            .position(|t| matches!(t, BuildTail::Param { .. }))
        {
            match &mut self.tail_children[idx] {
                BuildTail::Param {
                    name: existing,
                    node,
                } => {
                    if existing != name {
                        return Err(RouteError::InvalidPattern {
                            pattern: pattern.to_string(),
                            reason: "conflicting parameter name at the same position",
                        });
                    }
                    return Ok(node);
                }
                BuildTail::Wildcard(_) => unreachable!(),
            }
        }
        self.tail_children.push(BuildTail::Param {
            name: name.to_string(),
            node: BuildNode::default(),
        });
        match self.tail_children.last_mut().unwrap() {
            BuildTail::Param { node, .. } => Ok(node),
            BuildTail::Wildcard(_) => unreachable!(),
        }
    }

    fn tail_wildcard(&mut self) -> &mut BuildNode {
        if let Some(idx) = self
            .tail_children
            .iter()
            .position(|t| matches!(t, BuildTail::Wildcard(_)))
        {
            match &mut self.tail_children[idx] {
                BuildTail::Wildcard(node) => return node,
                BuildTail::Param { .. } => unreachable!(),
            }
        }
        self.tail_children
            .push(BuildTail::Wildcard(BuildNode::default()));
        match self.tail_children.last_mut().unwrap() {
            BuildTail::Wildcard(node) => node,
            BuildTail::Param { .. } => unreachable!(),
        }
    }

    /// Freeze into the immutable representation: intern strings, sort static
    /// children for binary search, rank parameter children narrowest-first,
    /// compute the per-node allowed-method bitset.
    pub(crate) fn freeze(self) -> Result<Node, AllocationExhausted> {
        let mut static_children = Vec::with_capacity(self.static_children.len());
        for (key, child) in self.static_children {
            static_children.push((memory::intern(&key)?, child.freeze()?));
        }
        static_children.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let mut param_children = Vec::with_capacity(self.param_children.len());
        for param in self.param_children {
            param_children.push(ParamChild {
                name: memory::intern(&param.name)?,
                ty: param.ty,
                node: param.node.freeze()?,
            });
        }
        param_children.sort_by_key(|p| p.ty);

        // A named capture outranks the anonymous wildcard.
        let mut tail_children = Vec::with_capacity(self.tail_children.len());
        for tail in self.tail_children {
            tail_children.push(match tail {
                BuildTail::Param { name, node } => TailChild::Param {
                    name: memory::intern(&name)?,
                    node: node.freeze()?,
                },
                BuildTail::Wildcard(node) => TailChild::Wildcard(node.freeze()?),
            });
        }
        tail_children.sort_by_key(|t| matches!(t, TailChild::Wildcard(_)));

        let mut allowed = MethodSet::default();
        for (method, _) in &self.routes {
            allowed.insert(*method);
        }

        Ok(Node {
            static_children: static_children.into_boxed_slice(),
            param_children: param_children.into_boxed_slice(),
            tail_children: tail_children.into_boxed_slice(),
            routes: self.routes.into_boxed_slice(),
            allowed,
        })
    }
}

/// An immutable trie node. The tree is a DAG from root to terminals and is
/// freely shared across worker threads.
pub struct Node {
    static_children: Box<[(&'static str, Node)]>,
    param_children: Box<[ParamChild]>,
    tail_children: Box<[TailChild]>,
    pub(crate) routes: Box<[(HttpMethod, u32)]>,
    pub(crate) allowed: MethodSet,
}

pub(crate) struct ParamChild {
    pub(crate) name: &'static str,
    pub(crate) ty: ParamType,
    pub(crate) node: Node,
}

pub(crate) enum TailChild {
    Param { name: &'static str, node: Node },
    Wildcard(Node),
}

impl Node {
    pub(crate) fn static_child(&self, segment: &str) -> Option<&Node> {
        self.static_children
            .binary_search_by(|(key, _)| str::cmp(key, segment))
            .ok()
            .map(|idx| &self.static_children[idx].1)
    }

    pub(crate) fn param_children(&self) -> &[ParamChild] {
        &self.param_children
    }

    pub(crate) fn tail_children(&self) -> &[TailChild] {
        &self.tail_children
    }

    pub(crate) fn is_terminal(&self) -> bool {
        !self.routes.is_empty()
    }

    pub(crate) fn route_for(&self, method: HttpMethod) -> Option<u32> {
        self.routes
            .iter()
            .find(|(m, _)| *m == method)
            .map(|(_, id)| *id)
    }
}
