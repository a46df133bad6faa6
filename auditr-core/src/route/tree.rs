//! Parameterized-path radix tree.
//!
//! A compressed trie over the static bytes of inserted templates, with a
//! single `:name` (param, matches one path segment) or `*name` (catch-all,
//! matches the remainder) wildcard child permitted per node. Similar in
//! shape to `matchit`'s router, reimplemented by hand here because this
//! component's contract needs priority-ordered children, an explicit
//! [`RouteError::Conflict`] on wildcard collision, and the ability to host
//! two independent trees per method (TARGET and SAMPLE), which is more
//! specific than `matchit`'s public API.

use crate::error::RouteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Static,
    Param,
    Catchall,
}

#[derive(Debug, Clone)]
enum Token {
    Static(String),
    Param(String),
    Catchall(String),
}

fn tokenize(template: &str) -> Vec<Token> {
    let bytes = template.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut static_start = 0;
    while i < bytes.len() {
        match bytes[i] {
            b':' => {
                if i > static_start {
                    tokens.push(Token::Static(template[static_start..i].to_string()));
                }
                let name_start = i + 1;
                let mut j = name_start;
                while j < bytes.len() && bytes[j] != b'/' {
                    j += 1;
                }
                tokens.push(Token::Param(template[name_start..j].to_string()));
                i = j;
                static_start = j;
            }
            b'*' => {
                if i > static_start {
                    tokens.push(Token::Static(template[static_start..i].to_string()));
                }
                let name_start = i + 1;
                tokens.push(Token::Catchall(template[name_start..].to_string()));
                i = bytes.len();
                static_start = i;
            }
            _ => i += 1,
        }
    }
    if static_start < bytes.len() {
        tokens.push(Token::Static(template[static_start..].to_string()));
    }
    tokens
}

/// A single named path parameter captured during [`PathTree::lookup`].
pub type Param = (String, String);

#[derive(Debug, Clone)]
struct PathNode<T: Clone> {
    fragment: String,
    kind: NodeKind,
    param_name: String,
    children: Vec<PathNode<T>>,
    wildcard: Option<Box<PathNode<T>>>,
    priority: u32,
    terminal: Option<T>,
}

impl<T: Clone> PathNode<T> {
    fn new_static(fragment: impl Into<String>) -> Self {
        PathNode {
            fragment: fragment.into(),
            kind: NodeKind::Static,
            param_name: String::new(),
            children: Vec::new(),
            wildcard: None,
            priority: 0,
            terminal: None,
        }
    }

    fn new_wildcard(kind: NodeKind, param_name: String) -> Self {
        PathNode {
            fragment: String::new(),
            kind,
            param_name,
            children: Vec::new(),
            wildcard: None,
            priority: 0,
            terminal: None,
        }
    }

    /// Sorts static children by descending priority (stable: ties keep
    /// insertion order) so that frequently-matched branches are probed
    /// first. Maintained after every insert.
    fn sort_children(&mut self) {
        self.children.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    fn insert_tokens(&mut self, tokens: &[Token], value: T) -> Result<(), RouteError> {
        self.priority += 1;
        let Some(first) = tokens.first() else {
            self.terminal = Some(value);
            return Ok(());
        };
        match first {
            Token::Static(s) if s.is_empty() => self.insert_tokens(&tokens[1..], value),
            Token::Static(s) => {
                if let Some(idx) = self
                    .children
                    .iter()
                    .position(|c| c.fragment.as_bytes().first() == s.as_bytes().first())
                {
                    let common = common_prefix_len(&self.children[idx].fragment, s);
                    if common < self.children[idx].fragment.len() {
                        split_child(&mut self.children[idx], common);
                    }
                    let child = &mut self.children[idx];
                    if common < s.len() {
                        let mut rest = Vec::with_capacity(tokens.len());
                        rest.push(Token::Static(s[common..].to_string()));
                        rest.extend_from_slice(&tokens[1..]);
                        child.insert_tokens(&rest, value)?;
                    } else {
                        child.insert_tokens(&tokens[1..], value)?;
                    }
                } else {
                    let mut child = PathNode::new_static(s.clone());
                    child.insert_tokens(&tokens[1..], value)?;
                    self.children.push(child);
                }
                self.sort_children();
                Ok(())
            }
            Token::Param(name) => self.attach_wildcard(NodeKind::Param, name.clone(), tokens, value),
            Token::Catchall(name) => {
                self.attach_wildcard(NodeKind::Catchall, name.clone(), tokens, value)
            }
        }
    }

    fn attach_wildcard(
        &mut self,
        kind: NodeKind,
        name: String,
        tokens: &[Token],
        value: T,
    ) -> Result<(), RouteError> {
        match &mut self.wildcard {
            Some(existing) if existing.kind == kind && existing.param_name == name => {
                existing.insert_tokens(&tokens[1..], value)
            }
            Some(_) => Err(RouteError::Conflict),
            None => {
                let mut node = PathNode::new_wildcard(kind, name);
                node.insert_tokens(&tokens[1..], value)?;
                self.wildcard = Some(Box::new(node));
                Ok(())
            }
        }
    }

    fn lookup<'a>(&'a self, path: &str, params: &mut Vec<Param>) -> Option<&'a T> {
        if !path.starts_with(self.fragment.as_str()) {
            return None;
        }
        let rest = &path[self.fragment.len()..];
        if rest.is_empty() {
            return self.terminal.as_ref();
        }
        if let Some(b0) = rest.as_bytes().first() {
            if let Some(child) = self
                .children
                .iter()
                .find(|c| c.fragment.as_bytes().first() == Some(b0))
            {
                if let Some(v) = child.lookup(rest, params) {
                    return Some(v);
                }
            }
        }
        if let Some(wc) = &self.wildcard {
            match wc.kind {
                NodeKind::Param => {
                    let end = rest.find('/').unwrap_or(rest.len());
                    if end == 0 {
                        return None;
                    }
                    let mut candidate = params.clone();
                    candidate.push((wc.param_name.clone(), rest[..end].to_string()));
                    if let Some(v) = wc.lookup(&rest[end..], &mut candidate) {
                        *params = candidate;
                        return Some(v);
                    }
                }
                NodeKind::Catchall => {
                    if rest.is_empty() {
                        return None;
                    }
                    if let Some(v) = wc.terminal.as_ref() {
                        params.push((wc.param_name.clone(), rest.to_string()));
                        return Some(v);
                    }
                }
                NodeKind::Static => unreachable!("wildcard child is never Static"),
            }
        }
        None
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

fn split_child<T: Clone>(child: &mut PathNode<T>, at: usize) {
    let prefix = child.fragment[..at].to_string();
    let suffix = child.fragment[at..].to_string();
    let mut moved = std::mem::replace(child, PathNode::new_static(prefix));
    moved.fragment = suffix;
    child.priority = moved.priority;
    child.children.push(moved);
}

/// A radix tree mapping path templates to a terminal value `T` (the matched
/// template string itself, in this crate's usage — see [`super::router`]).
#[derive(Debug, Clone)]
pub struct PathTree<T: Clone> {
    root: PathNode<T>,
}

impl<T: Clone> Default for PathTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PathTree<T> {
    pub fn new() -> Self {
        PathTree {
            root: PathNode::new_static(""),
        }
    }

    /// Inserts `template` with terminal value `value`. A duplicate insert of
    /// an equal template replaces the terminal value silently, permitting
    /// config reloads to re-register the same routes.
    pub fn insert(&mut self, template: &str, value: T) -> Result<(), RouteError> {
        if template.is_empty() {
            return Err(RouteError::EmptyPath);
        }
        if !template.starts_with('/') {
            return Err(RouteError::RelativePath(template.to_string()));
        }
        let tokens = tokenize(template);
        self.root.insert_tokens(&tokens, value)
    }

    /// Looks up `path`, returning the matched terminal value and any bound
    /// path parameters. Trailing-slash-sensitive: `/a` and `/a/` are
    /// distinct.
    pub fn lookup(&self, path: &str) -> (Option<&T>, Vec<Param>) {
        let mut params = Vec::new();
        let value = self.root.lookup(path, &mut params);
        (value, params)
    }
}
