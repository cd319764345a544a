//! Execution nodes and the graph they form.

use std::ops::Index;
use std::sync::Arc;

use alot::{LotId, Lots};

use crate::class::VirtualMethod;
use crate::exception::{ExceptionKind, ExceptionModel};
use crate::state::ExecutionState;
use crate::vm::{ExecutionError, Truncation};

/// A handle to an [`ExecutionNode`] in an [`ExecutionGraph`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct NodeId(LotId);

/// The invoking side of a call frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CallSite {
    /// The node that requested the call.
    pub node: NodeId,
    /// True if the frame runs a static initializer rather than a method the
    /// program invoked.
    pub initializer: bool,
}

/// One instruction executed on one path.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    address: u32,
    method: Arc<VirtualMethod>,
    state: ExecutionState,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    caller: Option<CallSite>,
    depth: usize,
    resuming: bool,
    exception: Option<ExceptionModel>,
    speculative: Vec<ExceptionKind>,
    error: Option<ExecutionError>,
}

impl ExecutionNode {
    pub(crate) fn new(address: u32, method: Arc<VirtualMethod>, state: ExecutionState) -> Self {
        Self {
            address,
            method,
            state,
            parent: None,
            children: Vec::new(),
            caller: None,
            depth: 0,
            resuming: false,
            exception: None,
            speculative: Vec::new(),
            error: None,
        }
    }

    /// Returns a node at `address` that continues this node's frame.
    pub(crate) fn successor(&self, address: u32) -> Self {
        Self {
            caller: self.caller,
            depth: self.depth,
            ..Self::new(address, self.method.clone(), self.state.clone())
        }
    }

    pub(crate) fn called_from(mut self, caller: CallSite, depth: usize) -> Self {
        self.caller = Some(caller);
        self.depth = depth;
        self
    }

    pub(crate) fn resumed(mut self) -> Self {
        self.resuming = true;
        self
    }

    /// Returns the address of this node's instruction.
    #[must_use]
    pub const fn address(&self) -> u32 {
        self.address
    }

    /// Returns the method this node executes in.
    #[must_use]
    pub fn method(&self) -> &Arc<VirtualMethod> {
        &self.method
    }

    /// Returns the state after this node's instruction executed.
    #[must_use]
    pub const fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Returns the state for modification.
    pub fn state_mut(&mut self) -> &mut ExecutionState {
        &mut self.state
    }

    /// Returns the node this node was expanded from.
    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Returns the nodes reachable from this one, in creation order.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Returns the invoking node, if this node belongs to a callee frame.
    #[must_use]
    pub const fn caller(&self) -> Option<CallSite> {
        self.caller
    }

    /// Returns the number of call frames below this node's frame.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Returns true if this node resumes its instruction after a call
    /// rather than executing it.
    #[must_use]
    pub const fn is_resuming(&self) -> bool {
        self.resuming
    }

    /// Returns the exception this node raises, if any.
    #[must_use]
    pub const fn exception(&self) -> Option<&ExceptionModel> {
        self.exception.as_ref()
    }

    /// Attaches `exception`. A node with an exception has no normal
    /// successors.
    pub fn set_exception(&mut self, exception: ExceptionModel) {
        self.exception = Some(exception);
    }

    /// Forgets every exception this node might raise, attached or
    /// speculative.
    pub fn clear_exceptions(&mut self) {
        self.exception = None;
        self.speculative.clear();
    }

    /// Returns the exceptions this node may raise depending on values that
    /// are not known.
    #[must_use]
    pub fn speculative_exceptions(&self) -> &[ExceptionKind] {
        &self.speculative
    }

    pub(crate) fn set_speculative_exceptions(&mut self, kinds: &[ExceptionKind]) {
        self.speculative = kinds.to_vec();
    }

    /// Returns the engine error that stopped this path, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&ExecutionError> {
        self.error.as_ref()
    }

    /// Returns true if nothing is reachable from this node.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.children.is_empty()
    }
}

/// Every node explored by one run.
#[derive(Debug)]
pub struct ExecutionGraph {
    nodes: Lots<ExecutionNode>,
    order: Vec<NodeId>,
    root: NodeId,
    errors: Vec<(NodeId, ExecutionError)>,
    truncation: Option<Truncation>,
}

impl ExecutionGraph {
    pub(crate) fn new(root: ExecutionNode) -> Self {
        let mut nodes = Lots::new();
        let root = NodeId(nodes.push(root));
        Self {
            nodes,
            order: vec![root],
            root,
            errors: Vec::new(),
            truncation: None,
        }
    }

    /// Returns the first node of the run.
    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the node with `id`.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&ExecutionNode> {
        self.nodes.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut ExecutionNode> {
        self.nodes.get_mut(id.0)
    }

    /// Returns the children of `id`.
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.get(id) {
            Some(node) => node.children(),
            None => &[],
        }
    }

    /// Returns every node in the order it was created.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ExecutionNode)> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.get(*id).map(|node| (*id, node)))
    }

    /// Returns every node that ends a path: returns from the entry method,
    /// uncaught exceptions, engine errors, and nodes left unexpanded by a
    /// truncated run.
    pub fn terminals(&self) -> impl Iterator<Item = (NodeId, &ExecutionNode)> + '_ {
        self.nodes().filter(|(_, node)| node.is_terminal())
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the graph has no nodes. A graph always has its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the engine errors that stopped paths, with the node each
    /// occurred on.
    #[must_use]
    pub fn errors(&self) -> &[(NodeId, ExecutionError)] {
        &self.errors
    }

    /// Returns why expansion stopped early, if it did.
    #[must_use]
    pub const fn truncation(&self) -> Option<Truncation> {
        self.truncation
    }

    /// Returns true if every reachable path was explored.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.truncation.is_none()
    }

    /// Adds `node` as the last child of `parent`.
    pub(crate) fn attach(&mut self, parent: NodeId, mut node: ExecutionNode) -> NodeId {
        node.parent = Some(parent);
        let id = NodeId(self.nodes.push(node));
        self.order.push(id);
        if let Some(parent) = self.nodes.get_mut(parent.0) {
            parent.children.push(id);
        }
        id
    }

    pub(crate) fn record_error(&mut self, id: NodeId, error: ExecutionError) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.error = Some(error.clone());
        }
        self.errors.push((id, error));
    }

    pub(crate) fn truncate(&mut self, reason: Truncation) {
        self.truncation.get_or_insert(reason);
    }
}

impl Index<NodeId> for ExecutionGraph {
    type Output = ExecutionNode;

    fn index(&self, id: NodeId) -> &Self::Output {
        self.get(id).expect("node ids are only issued by this graph")
    }
}
