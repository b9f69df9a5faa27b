//! Read-only traversal over one owned snapshot.
//!
//! Every search is pre-order, depth-first, first match wins, which matches the
//! order the platform reports elements in.

use crate::schema::{NodeRef, UiElement};

/// An element found in a snapshot together with its index path from the root.
#[derive(Debug, Clone)]
pub struct Hit<'a> {
    pub node: &'a UiElement,
    pub path: Vec<usize>,
}

impl<'a> Hit<'a> {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef { path: self.path.clone(), bounds: self.node.bounds }
    }
}

/// Every non-blank text and description in the tree, in pre-order.
pub fn collect_texts(root: &UiElement) -> Vec<String> {
    let mut texts = Vec::new();
    collect_into(root, &mut texts);
    texts
}

fn collect_into(node: &UiElement, out: &mut Vec<String>) {
    for value in [node.text.as_deref(), node.description.as_deref()].into_iter().flatten() {
        if !value.trim().is_empty() {
            out.push(value.to_string());
        }
    }
    for child in &node.children {
        collect_into(child, out);
    }
}

pub fn find<'a, P>(root: &'a UiElement, predicate: P) -> Option<Hit<'a>>
where
    P: Fn(&UiElement) -> bool,
{
    let mut path = Vec::new();
    find_rec(root, &predicate, &mut path).map(|node| Hit { node, path })
}

fn find_rec<'a, P>(node: &'a UiElement, predicate: &P, path: &mut Vec<usize>) -> Option<&'a UiElement>
where
    P: Fn(&UiElement) -> bool,
{
    if predicate(node) {
        return Some(node);
    }
    for (idx, child) in node.children.iter().enumerate() {
        path.push(idx);
        if let Some(found) = find_rec(child, predicate, path) {
            return Some(found);
        }
        path.pop();
    }
    None
}

pub fn exists<P>(root: &UiElement, predicate: P) -> bool
where
    P: Fn(&UiElement) -> bool,
{
    find(root, predicate).is_some()
}

pub fn find_scrollable(root: &UiElement) -> Option<Hit<'_>> {
    find(root, |n| n.scrollable)
}

/// The input-focused element, if it accepts text.
pub fn find_focused_editable(root: &UiElement) -> Option<Hit<'_>> {
    find(root, |n| n.focused && n.editable)
}

/// Nearest clickable element on the path from `hit` up to the root, the hit
/// itself included.
pub fn clickable_ancestor<'a>(root: &'a UiElement, hit: &Hit<'_>) -> Option<Hit<'a>> {
    let mut chain: Vec<(&'a UiElement, usize)> = Vec::with_capacity(hit.path.len() + 1);
    let mut node = root;
    chain.push((node, 0));
    for (depth, &idx) in hit.path.iter().enumerate() {
        node = node.children.get(idx)?;
        chain.push((node, depth + 1));
    }

    chain
        .into_iter()
        .rev()
        .find(|(n, _)| n.clickable)
        .map(|(n, depth)| Hit { node: n, path: hit.path[..depth].to_vec() })
}

pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

pub fn equals_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}
