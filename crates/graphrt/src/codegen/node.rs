//! Flat graph node records and their JSON wire forms.
//!
//! The emitted document is a stable contract with the graph runtime, so the
//! node and attribute shapes are serialized by hand rather than derived.

use serde::ser::{SerializeSeq, SerializeStruct, Serializer};
use serde::Serialize;

/// One output of one graph node, serialized as `[node, output, version]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub node: usize,
    pub output: usize,
    pub version: usize,
}

impl NodeRef {
    pub fn new(node: usize, output: usize) -> Self {
        Self {
            node,
            output,
            version: 0,
        }
    }
}

impl Serialize for NodeRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.node)?;
        seq.serialize_element(&self.output)?;
        seq.serialize_element(&self.version)?;
        seq.end()
    }
}

/// Storage-plan and type attributes stamped on every node, one entry per
/// tensor output.
#[derive(Debug, Clone, Default)]
pub struct NodeAttrs {
    pub storage_ids: Vec<i64>,
    /// Present iff the plan is device-annotated (all-or-none rule).
    pub device_index: Option<Vec<i64>>,
    pub shapes: Vec<Vec<i64>>,
    pub dtypes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InputNode {
    pub name: String,
    pub attrs: NodeAttrs,
}

#[derive(Debug, Clone)]
pub struct OpNode {
    /// Display name, deduplicated across the graph.
    pub name: String,
    /// Symbol of the lowered kernel (`func_name` in the wire format).
    pub op_name: String,
    pub inputs: Vec<NodeRef>,
    pub attrs: NodeAttrs,
}

#[derive(Debug, Clone)]
pub enum GraphNode {
    Input(InputNode),
    Op(OpNode),
}

impl GraphNode {
    pub fn attrs(&self) -> &NodeAttrs {
        match self {
            GraphNode::Input(node) => &node.attrs,
            GraphNode::Op(node) => &node.attrs,
        }
    }

    pub fn attrs_mut(&mut self) -> &mut NodeAttrs {
        match self {
            GraphNode::Input(node) => &mut node.attrs,
            GraphNode::Op(node) => &mut node.attrs,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            GraphNode::Input(node) => &node.name,
            GraphNode::Op(node) => &node.name,
        }
    }

    pub fn num_outputs(&self) -> usize {
        self.attrs().shapes.len().max(1)
    }

    pub fn is_input(&self) -> bool {
        matches!(self, GraphNode::Input(_))
    }
}

#[derive(Serialize)]
struct OpAttrsWire<'a> {
    func_name: &'a str,
    flatten_data: &'static str,
    num_inputs: String,
    num_outputs: String,
}

impl Serialize for GraphNode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            GraphNode::Input(node) => {
                let mut state = serializer.serialize_struct("GraphNode", 3)?;
                state.serialize_field("op", "null")?;
                state.serialize_field("name", &node.name)?;
                state.serialize_field("inputs", &[] as &[NodeRef])?;
                state.end()
            }
            GraphNode::Op(node) => {
                let mut state = serializer.serialize_struct("GraphNode", 4)?;
                state.serialize_field("op", "tvm_op")?;
                state.serialize_field("name", &node.name)?;
                state.serialize_field(
                    "attrs",
                    &OpAttrsWire {
                        func_name: &node.op_name,
                        flatten_data: "0",
                        num_inputs: node.inputs.len().to_string(),
                        num_outputs: self.num_outputs().to_string(),
                    },
                )?;
                state.serialize_field("inputs", &node.inputs)?;
                state.end()
            }
        }
    }
}

/// Top-level document, field order matching the runtime's reader.
#[derive(Serialize)]
pub(super) struct GraphJson<'a> {
    pub nodes: &'a [GraphNode],
    pub arg_nodes: Vec<usize>,
    pub heads: &'a [NodeRef],
    pub attrs: GraphAttrsJson,
    pub node_row_ptr: Vec<usize>,
}

#[derive(Serialize)]
pub(super) struct GraphAttrsJson {
    pub shape: (&'static str, Vec<Vec<i64>>),
    pub storage_id: (&'static str, Vec<i64>),
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_index: Option<(&'static str, Vec<i64>)>,
    pub dltype: (&'static str, Vec<String>),
}
