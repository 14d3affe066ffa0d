//! The document collaborator: read-only traversal and mutation notices.
//!
//! The runtime never edits documents. It reads text-bearing leaves through
//! [`DocumentView`] and reacts to [`DocumentChange`] notices. [`Document`] is
//! a small in-memory implementation with ProseMirror-style offsets: every
//! element contributes one token for its opening and one for its closing,
//! text contributes one per character.

use std::ops::Range;
use std::sync::RwLock;

use tokio::sync::broadcast;

/// A text-bearing leaf seen during traversal.
#[derive(Debug, Clone, Copy)]
pub struct TextLeaf<'a> {
    pub offset: usize,
    pub size: usize,
    /// Cell markers attached to this text.
    pub markers: &'a [String],
}

/// Read-only traversal of a document's content tree.
pub trait DocumentView: Send + Sync {
    /// Visit text leaves in document order until `visit` returns `false`.
    fn for_each_text(&self, visit: &mut dyn FnMut(TextLeaf<'_>) -> bool);
}

/// A structural or content change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentChange {
    /// Affected offsets, `None` when the whole document may have changed.
    pub range: Option<Range<usize>>,
}

impl DocumentChange {
    pub fn whole() -> Self {
        Self { range: None }
    }

    pub fn range(range: Range<usize>) -> Self {
        Self { range: Some(range) }
    }
}

/// A node in the in-memory document tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element { kind: String, children: Vec<Node> },
    Text { text: String, markers: Vec<String> },
}

impl Node {
    pub fn element(kind: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element {
            kind: kind.into(),
            children,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text {
            text: text.into(),
            markers: Vec::new(),
        }
    }

    /// Text carrying a cell marker.
    pub fn cell(id: impl Into<String>, code: impl Into<String>) -> Self {
        Node::Text {
            text: code.into(),
            markers: vec![id.into()],
        }
    }

    /// Number of offset tokens this node occupies.
    pub fn size(&self) -> usize {
        match self {
            Node::Element { children, .. } => 2 + children.iter().map(Node::size).sum::<usize>(),
            Node::Text { text, .. } => text.chars().count(),
        }
    }
}

/// Walk `nodes` starting at `offset`; returns `false` once the visitor stops.
fn walk(nodes: &[Node], mut offset: usize, visit: &mut dyn FnMut(TextLeaf<'_>) -> bool) -> bool {
    for node in nodes {
        match node {
            Node::Element { children, .. } => {
                if !walk(children, offset + 1, visit) {
                    return false;
                }
            }
            Node::Text { markers, .. } => {
                let leaf = TextLeaf {
                    offset,
                    size: node.size(),
                    markers,
                };
                if !visit(leaf) {
                    return false;
                }
            }
        }
        offset += node.size();
    }
    true
}

/// In-memory document with a mutation channel.
#[derive(Debug)]
pub struct Document {
    content: RwLock<Vec<Node>>,
    changes: broadcast::Sender<DocumentChange>,
}

impl Document {
    pub fn new(content: Vec<Node>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            content: RwLock::new(content),
            changes,
        }
    }

    /// Receive every change made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    /// Total size of the top-level content.
    pub fn size(&self) -> usize {
        self.content
            .read()
            .map(|c| c.iter().map(Node::size).sum())
            .unwrap_or(0)
    }

    /// Replace the whole content.
    pub fn replace(&self, content: Vec<Node>) -> DocumentChange {
        if let Ok(mut current) = self.content.write() {
            *current = content;
        }
        self.publish(DocumentChange::whole())
    }

    /// Insert a top-level node at `index`; the change covers the inserted span.
    pub fn insert(&self, index: usize, node: Node) -> DocumentChange {
        let change = match self.content.write() {
            Ok(mut content) => {
                let index = index.min(content.len());
                let start: usize = content[..index].iter().map(Node::size).sum();
                let end = start + node.size();
                content.insert(index, node);
                DocumentChange::range(start..end)
            }
            Err(_) => DocumentChange::whole(),
        };
        self.publish(change)
    }

    /// Remove the top-level node at `index`, if any.
    pub fn remove(&self, index: usize) -> Option<Node> {
        let (removed, change) = match self.content.write() {
            Ok(mut content) if index < content.len() => {
                let start: usize = content[..index].iter().map(Node::size).sum();
                let node = content.remove(index);
                let change = DocumentChange::range(start..start + node.size());
                (Some(node), change)
            }
            _ => return None,
        };
        self.publish(change);
        removed
    }

    /// Apply an arbitrary edit; reported as a whole-document change.
    pub fn edit(&self, f: impl FnOnce(&mut Vec<Node>)) -> DocumentChange {
        if let Ok(mut content) = self.content.write() {
            f(&mut content);
        }
        self.publish(DocumentChange::whole())
    }

    fn publish(&self, change: DocumentChange) -> DocumentChange {
        // No receivers is fine: nobody follows this document yet.
        let _ = self.changes.send(change.clone());
        change
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DocumentView for Document {
    fn for_each_text(&self, visit: &mut dyn FnMut(TextLeaf<'_>) -> bool) {
        if let Ok(content) = self.content.read() {
            walk(&content, 0, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(doc: &Document) -> Vec<(usize, usize, Vec<String>)> {
        let mut out = Vec::new();
        doc.for_each_text(&mut |leaf| {
            out.push((leaf.offset, leaf.size, leaf.markers.to_vec()));
            true
        });
        out
    }

    #[test]
    fn test_offsets_count_element_boundaries() {
        let doc = Document::new(vec![
            Node::element("paragraph", vec![Node::text("ab"), Node::cell("c1", "1+1")]),
            Node::element("paragraph", vec![Node::text("xyz")]),
        ]);

        assert_eq!(
            leaves(&doc),
            vec![
                (1, 2, vec![]),
                (3, 3, vec!["c1".to_string()]),
                (8, 3, vec![]),
            ]
        );
        assert_eq!(doc.size(), 12);
    }

    #[test]
    fn test_visitor_can_stop() {
        let doc = Document::new(vec![Node::text("a"), Node::text("b"), Node::text("c")]);
        let mut seen = 0;
        doc.for_each_text(&mut |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_insert_reports_range() {
        let doc = Document::new(vec![Node::text("abc")]);
        let mut rx = doc.subscribe();
        let change = doc.insert(1, Node::text("de"));
        assert_eq!(change, DocumentChange::range(3..5));
        assert_eq!(rx.try_recv().unwrap(), change);
    }

    #[test]
    fn test_remove_out_of_bounds() {
        let doc = Document::new(vec![Node::text("abc")]);
        assert!(doc.remove(3).is_none());
        assert_eq!(doc.remove(0), Some(Node::text("abc")));
        assert_eq!(doc.size(), 0);
    }
}
