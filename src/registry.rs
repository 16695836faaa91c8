// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The service registry (C4): an immutable, mount-time-only tree of named
//! services and replies, indexed into a flat `#.svc:Method` lookup table for
//! O(1) dispatch. Mirrors the teacher's preference for building an
//! immutable structure once (`Pool::login_and_insert`-style construction)
//! and then only ever reading it from worker threads.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::Value;
use crate::error::{ErrorLevel, RpcError};
use crate::runtime::{Return, Runtime};

/// Maximum nesting depth for service mount paths, matching §5's resource
/// bounds on pathological configuration.
pub const MAX_NODE_DEPTH: usize = 16;

fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The reflective handler signature: it receives the already-decoded
/// argument values and a handle to the current call's [`Runtime`], and must
/// terminate by calling `rt.ok(..)` or `rt.error(..)`.
pub type ReflectiveHandler = Arc<dyn Fn(&Runtime, &[Value]) -> Return + Send + Sync>;

/// An optional fast path that reads its arguments directly off the wire
/// stream rather than through the generic `Value` decode, avoiding the
/// intermediate `Vec<Value>` allocation. Registered by hand (no codegen —
/// see DESIGN.md) when a reply is hot enough to warrant it.
pub type FastPathHandler =
    Arc<dyn Fn(&Runtime, &mut crate::codec::Stream) -> Return + Send + Sync>;

#[derive(Clone)]
pub struct ReplyMeta {
    pub path: String,
    pub signature: String,
    pub declared_at: String,
    pub handler: ReflectiveHandler,
    pub fast_path: Option<FastPathHandler>,
}

impl ReplyMeta {
    pub fn arg_count(&self) -> usize {
        self.signature.chars().count()
    }
}

struct ServiceNode {
    name: String,
    children: Vec<ServiceNode>,
    replies: HashMap<String, ReplyMeta>,
}

impl ServiceNode {
    fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), children: Vec::new(), replies: HashMap::new() }
    }
}

/// A mount-time builder for one service subtree. Consumed by
/// [`RegistryBuilder::mount`] to fold into the final immutable [`Registry`].
pub struct ServiceBuilder {
    node: ServiceNode,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { node: ServiceNode::new(name) }
    }

    #[must_use]
    pub fn reply(
        mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        handler: ReflectiveHandler,
    ) -> Self {
        let name = name.into();
        let signature = signature.into();
        self.node.replies.insert(
            name.clone(),
            ReplyMeta {
                path: name,
                signature,
                declared_at: crate::error::here(),
                handler,
                fast_path: None,
            },
        );
        self
    }

    #[must_use]
    pub fn reply_with_fast_path(
        mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        handler: ReflectiveHandler,
        fast_path: FastPathHandler,
    ) -> Self {
        let name = name.into();
        let signature = signature.into();
        self.node.replies.insert(
            name.clone(),
            ReplyMeta {
                path: name,
                signature,
                declared_at: crate::error::here(),
                handler,
                fast_path: Some(fast_path),
            },
        );
        self
    }

    /// Appends a child service. Duplicate child names are not rejected
    /// here — `ServiceBuilder` has no fallible return — but are a hard
    /// mount error surfaced by [`RegistryBuilder::build`], mirroring how
    /// duplicate reply paths are only caught at flatten time rather than
    /// at `reply()`.
    #[must_use]
    pub fn child(mut self, child: ServiceBuilder) -> Self {
        self.node.children.push(child.node);
        self
    }
}

/// The immutable, flattened registry produced by [`RegistryBuilder::build`].
pub struct Registry {
    flat: HashMap<String, Arc<ReplyMeta>>,
}

impl Registry {
    pub fn lookup(&self, path: &str) -> Option<Arc<ReplyMeta>> {
        self.flat.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.flat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flat.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    roots: Vec<ServiceNode>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mount(mut self, service: ServiceBuilder) -> Self {
        self.roots.push(service.node);
        self
    }

    /// Validates identifiers, signatures and nesting depth, then flattens
    /// the tree into dotted `#.svc:Method` paths. This is the only place
    /// service paths are computed; dispatch afterward is a single hash
    /// lookup.
    pub fn build(self) -> Result<Registry, RpcError> {
        let mut flat = HashMap::new();
        for root in self.roots {
            Self::flatten(&root, "#", 0, &mut flat)?;
        }
        Ok(Registry { flat })
    }

    fn flatten(
        node: &ServiceNode,
        prefix: &str,
        depth: usize,
        flat: &mut HashMap<String, Arc<ReplyMeta>>,
    ) -> Result<(), RpcError> {
        if depth > MAX_NODE_DEPTH {
            return Err(RpcError::config(
                1,
                ErrorLevel::Fatal,
                format!("service mount depth exceeds {MAX_NODE_DEPTH} at {prefix}"),
            ));
        }
        if !valid_identifier(&node.name) {
            return Err(RpcError::config(
                2,
                ErrorLevel::Fatal,
                format!("invalid service identifier: {:?}", node.name),
            ));
        }
        let svc_path = if prefix == "#" { format!("#.{}", node.name) } else { format!("{prefix}.{}", node.name) };

        for (reply_name, meta) in &node.replies {
            if !valid_identifier(reply_name) {
                return Err(RpcError::config(
                    3,
                    ErrorLevel::Fatal,
                    format!("invalid reply identifier: {reply_name:?}"),
                ));
            }
            if let Err(pos) = crate::codec::value::validate_signature(&meta.signature) {
                return Err(RpcError::config(
                    4,
                    ErrorLevel::Fatal,
                    format!(
                        "reply {svc_path}:{reply_name} has unsupported signature character at position {pos}"
                    ),
                ));
            }
            let full_path = format!("{svc_path}:{reply_name}");
            if flat.insert(full_path.clone(), Arc::new(meta.clone())).is_some() {
                return Err(RpcError::config(
                    5,
                    ErrorLevel::Fatal,
                    format!("duplicate reply path: {full_path}"),
                ));
            }
        }

        let mut seen_children = std::collections::HashSet::with_capacity(node.children.len());
        for child in &node.children {
            if !seen_children.insert(child.name.as_str()) {
                return Err(RpcError::config(
                    6,
                    ErrorLevel::Fatal,
                    format!("duplicate child service name: {svc_path}.{}", child.name),
                ));
            }
        }
        for child in &node.children {
            Self::flatten(child, &svc_path, depth + 1, flat)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn noop_handler() -> ReflectiveHandler {
        Arc::new(|rt: &Runtime, _args: &[Value]| rt.ok(Value::Null))
    }

    #[test]
    fn builds_flat_dotted_paths() {
        let registry = RegistryBuilder::new()
            .mount(
                ServiceBuilder::new("user")
                    .reply("Get", "I", noop_handler())
                    .child(ServiceBuilder::new("admin").reply("Ban", "IS", noop_handler())),
            )
            .build()
            .expect("build");
        assert!(registry.lookup("#.user:Get").is_some());
        assert!(registry.lookup("#.user.admin:Ban").is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn rejects_invalid_identifier() {
        let err = RegistryBuilder::new()
            .mount(ServiceBuilder::new("1bad").reply("Get", "I", noop_handler()))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn rejects_unsupported_signature_char() {
        let err = RegistryBuilder::new()
            .mount(ServiceBuilder::new("svc").reply("Get", "IZ", noop_handler()))
            .build()
            .unwrap_err();
        assert!(err.message().contains("position 1"));
    }

    #[test]
    fn rejects_duplicate_child_service_name() {
        let err = RegistryBuilder::new()
            .mount(
                ServiceBuilder::new("user")
                    .child(ServiceBuilder::new("admin").reply("Ban", "IS", noop_handler()))
                    .child(ServiceBuilder::new("admin").reply("Unban", "IS", noop_handler())),
            )
            .build()
            .unwrap_err();
        assert!(err.message().contains("user.admin"));
    }

    #[test]
    fn rejects_duplicate_reply_path_across_roots() {
        let err = RegistryBuilder::new()
            .mount(ServiceBuilder::new("svc").reply("Get", "I", noop_handler()))
            .mount(ServiceBuilder::new("svc").reply("Get", "I", noop_handler()))
            .build()
            .unwrap_err();
        assert!(err.message().contains("#.svc:Get"));
    }
}
