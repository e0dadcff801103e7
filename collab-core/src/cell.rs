//! Diagram cells - the nodes and edges a threat model diagram is made of.

use serde::{Deserialize, Serialize};

/// Shapes a node cell may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeShape {
    /// External entity interacting with the system.
    Actor,
    /// A process transforming data.
    Process,
    /// A data store.
    Store,
    /// A trust boundary enclosing other cells.
    SecurityBoundary,
    /// Free-form annotation.
    TextBox,
}

impl NodeShape {
    /// Wire name of the shape.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Process => "process",
            Self::Store => "store",
            Self::SecurityBoundary => "security-boundary",
            Self::TextBox => "text-box",
        }
    }
}

/// Shapes an edge cell may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeShape {
    /// A data flow between two nodes.
    Edge,
}

/// A point in diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

/// Width and height of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    /// Width in diagram units.
    pub width: f64,
    /// Height in diagram units.
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 120.0,
            height: 60.0,
        }
    }
}

/// A node cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Cell identifier.
    pub id: String,
    /// Visual shape.
    pub shape: NodeShape,
    /// Top-left position.
    #[serde(default)]
    pub position: Point,
    /// Node dimensions.
    #[serde(default)]
    pub size: Size,
    /// Presentation attributes (labels, styling).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<serde_json::Value>,
    /// Application data attached to the cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Enclosing cell, usually a security boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Stacking order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
    /// Whether the node is rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

impl Node {
    /// Create a node at the origin with default size.
    #[must_use]
    pub fn new(id: impl Into<String>, shape: NodeShape) -> Self {
        Self {
            id: id.into(),
            shape,
            position: Point::default(),
            size: Size::default(),
            attrs: None,
            data: None,
            parent: None,
            z_index: None,
            visible: None,
        }
    }

    /// Set the position.
    #[must_use]
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Point { x, y };
        self
    }

    /// Set the label, stored as `attrs.text.text`.
    #[must_use]
    pub fn with_label(mut self, label: &str) -> Self {
        self.attrs = Some(serde_json::json!({ "text": { "text": label } }));
        self
    }
}

/// One end of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeTerminal {
    /// The connected cell.
    pub cell: String,
    /// Optional port on that cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

impl EdgeTerminal {
    /// Terminal attached to a cell without a specific port.
    #[must_use]
    pub fn cell(cell: impl Into<String>) -> Self {
        Self {
            cell: cell.into(),
            port: None,
        }
    }
}

/// An edge cell connecting two other cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Cell identifier.
    pub id: String,
    /// Visual shape.
    pub shape: EdgeShape,
    /// Where the edge starts.
    pub source: EdgeTerminal,
    /// Where the edge ends.
    pub target: EdgeTerminal,
    /// Intermediate routing points.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vertices: Vec<Point>,
    /// Edge labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<serde_json::Value>,
    /// Presentation attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<serde_json::Value>,
    /// Application data attached to the cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Stacking order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
}

impl Edge {
    /// Create an edge between two cells.
    #[must_use]
    pub fn new(id: impl Into<String>, source: &str, target: &str) -> Self {
        Self {
            id: id.into(),
            shape: EdgeShape::Edge,
            source: EdgeTerminal::cell(source),
            target: EdgeTerminal::cell(target),
            vertices: Vec::new(),
            labels: None,
            attrs: None,
            data: None,
            z_index: None,
        }
    }
}

/// A diagram cell.
///
/// Serialized untagged: an object with `source` and `target` terminals is an
/// edge, anything else with a node shape is a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    /// An edge between two cells.
    Edge(Edge),
    /// A node.
    Node(Node),
}

impl Cell {
    /// The cell identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Edge(edge) => &edge.id,
            Self::Node(node) => &node.id,
        }
    }

    /// Parse a cell from untrusted JSON.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the value is neither a valid node nor a valid edge.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    /// Cells this cell refers to (edge terminals and node parent).
    #[must_use]
    pub fn references(&self) -> Vec<&str> {
        match self {
            Self::Edge(edge) => vec![edge.source.cell.as_str(), edge.target.cell.as_str()],
            Self::Node(node) => node.parent.as_deref().into_iter().collect(),
        }
    }
}

impl From<Node> for Cell {
    fn from(node: Node) -> Self {
        Self::Node(node)
    }
}

impl From<Edge> for Cell {
    fn from(edge: Edge) -> Self {
        Self::Edge(edge)
    }
}
