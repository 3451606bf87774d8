use serde::{Deserialize, Serialize};

use forkchat_core::{HistoryError, NodeId, NodeStatus, Role, SessionSnapshot};

use crate::resolver;

pub const DEFAULT_PREVIEW_CHARS: usize = 80;

/// Display projection of one node and everything below it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchNode {
    pub id: NodeId,
    pub role: Role,
    pub status: NodeStatus,
    pub content_preview: String,
    pub is_active: bool,
    pub children: Vec<BranchNode>,
}

impl BranchNode {
    /// Number of nodes in this subtree, counted without recursion.
    pub fn size(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

/// Truncate to `max_chars` characters, marking the cut with `…`.
pub fn preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &content[..cut]),
        None => content.to_string(),
    }
}

/// Project the snapshot into a nested tree rooted at the session root.
///
/// Children are assembled bottom-up from an explicit post-order stack, so
/// arbitrarily deep conversations never grow the call stack.
pub fn build_tree(snapshot: &SessionSnapshot, preview_chars: usize) -> Result<BranchNode, HistoryError> {
    let mut active = vec![false; snapshot.len()];
    for i in resolver::active_path_indices(snapshot)? {
        active[i] = true;
    }

    let mut built: Vec<Option<BranchNode>> = vec![None; snapshot.len()];
    let mut stack = vec![(snapshot.root_index(), false)];
    while let Some((idx, expanded)) = stack.pop() {
        if !expanded {
            stack.push((idx, true));
            stack.extend(snapshot.child_indices(idx).iter().rev().map(|&c| (c, false)));
            continue;
        }
        let children = snapshot
            .child_indices(idx)
            .iter()
            .filter_map(|&c| built[c].take())
            .collect();
        let node = snapshot.at(idx);
        built[idx] = Some(BranchNode {
            id: node.id.clone(),
            role: node.role,
            status: node.status,
            content_preview: preview(&node.content, preview_chars),
            is_active: active[idx],
            children,
        });
    }

    built[snapshot.root_index()]
        .take()
        .ok_or_else(|| HistoryError::Storage(format!("root of session {} not built", snapshot.session().id)))
}

pub fn has_branching(snapshot: &SessionSnapshot) -> bool {
    (0..snapshot.len()).any(|i| snapshot.child_indices(i).len() >= 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::fixtures::TreeFixture;

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 80), "short");
        assert_eq!(preview("abcdef", 3), "abc…");
        assert_eq!(preview("héllo wörld", 5), "héllo…");
        assert_eq!(preview("exact", 5), "exact");
    }

    #[test]
    fn active_flags_follow_head() {
        let mut t = TreeFixture::new("sys");
        let root = t.root();
        let u1 = t.user(&root, "Hi");
        let a1 = t.assistant(&u1, "Hello!");
        let u1b = t.user(&root, "Hey");
        let tree = build_tree(&t.snapshot(&u1b), DEFAULT_PREVIEW_CHARS).unwrap();

        assert!(tree.is_active);
        assert_eq!(tree.children.len(), 2);
        let (first, second) = (&tree.children[0], &tree.children[1]);
        assert_eq!(first.id, u1);
        assert!(!first.is_active);
        assert_eq!(first.children[0].id, a1);
        assert!(!first.children[0].is_active);
        assert_eq!(second.id, u1b);
        assert!(second.is_active);
        assert_eq!(tree.size(), 4);
    }

    #[test]
    fn deep_chain_builds_without_recursion() {
        let mut t = TreeFixture::new("");
        let mut tip = t.root();
        for i in 0..3_000 {
            tip = t.user(&tip, &format!("turn {i}"));
        }
        let tree = build_tree(&t.snapshot(&tip), 10).unwrap();
        assert_eq!(tree.size(), 3_001);
    }

    #[test]
    fn branching_detection() {
        let mut t = TreeFixture::new("");
        let root = t.root();
        let u1 = t.user(&root, "a");
        t.assistant(&u1, "b");
        assert!(!has_branching(&t.snapshot(&root)));
        t.assistant(&u1, "b2");
        assert!(has_branching(&t.snapshot(&root)));
    }

    #[test]
    fn serializes_camel_case() {
        let t = TreeFixture::new("system prompt");
        let tree = build_tree(&t.snapshot(&t.root()), 6).unwrap();
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["contentPreview"], "system…");
        assert_eq!(json["isActive"], true);
        assert_eq!(json["role"], "system");
        assert_eq!(json["status"], "committed");
    }
}
