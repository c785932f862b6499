//! Structural control-flow analysis.
//!
//! Reduces the flow graph of a subgraph to a structural tree by repeatedly
//! applying basic region patterns (Sequence, If-Then, If-Then-Else, Repeat,
//! While, Loop) until a fixpoint. Each pattern matches a region with a
//! single entry and a single exit; incoming edges into a child disqualify a
//! match, so a pattern always reduces the smallest reducible region. If the
//! fixpoint settles with more than one active node the graph is
//! irreducible and cannot be represented as a tree.
//!
//! Virtual Start and Stop nodes bracket the graph: every entry point flows
//! from Start and every block without an in-graph successor flows to Stop.
//! Neither is ever folded.

use crate::block::BasicBlock;
use crate::subgraph::{BasicBlockId, Subgraph};
use crate::Error;

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

/// A node of the structural tree: a leaf wrapping a single code block, or a
/// region operator over child trees.
#[derive(Debug, PartialEq, Eq)]
pub enum StructuralNode {
    /// The virtual entry node.
    Start,
    /// The virtual exit node.
    Stop,
    /// A leaf wrapping one code block.
    Base(BasicBlockId),
    /// Two regions executed one after the other.
    Sequence {
        /// The first region.
        entry: Box<StructuralNode>,
        /// The region executed after it.
        tail: Box<StructuralNode>,
    },
    /// A guarded region with a fall-through.
    IfThen {
        /// The region deciding the branch.
        entry: Box<StructuralNode>,
        /// The region executed when the branch is taken.
        then: Box<StructuralNode>,
    },
    /// A two-armed branch joining at a common exit.
    IfThenElse {
        /// The region deciding the branch.
        entry: Box<StructuralNode>,
        /// The taken arm.
        then: Box<StructuralNode>,
        /// The fall-through arm.
        otherwise: Box<StructuralNode>,
    },
    /// A region repeating itself until its exit condition holds.
    Repeat {
        /// The repeated region.
        body: Box<StructuralNode>,
    },
    /// A guard region with a body looping back to it.
    While {
        /// The guard region.
        entry: Box<StructuralNode>,
        /// The looping body.
        body: Box<StructuralNode>,
    },
    /// A region spinning on itself with no exit.
    Loop {
        /// The spinning region.
        body: Box<StructuralNode>,
    },
}

impl StructuralNode {
    fn render(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "    ".repeat(indent);
        match self {
            StructuralNode::Start => writeln!(f, "{pad}START"),
            StructuralNode::Stop => writeln!(f, "{pad}STOP"),
            StructuralNode::Base(block) => writeln!(f, "{pad}{block}"),
            StructuralNode::Sequence { entry, tail } => {
                entry.render(f, indent)?;
                tail.render(f, indent)
            }
            StructuralNode::IfThen { entry, then } => {
                writeln!(f, "{pad}IF {{")?;
                entry.render(f, indent + 1)?;
                writeln!(f, "{pad}}} THEN {{")?;
                then.render(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
            StructuralNode::IfThenElse {
                entry,
                then,
                otherwise,
            } => {
                writeln!(f, "{pad}IF {{")?;
                entry.render(f, indent + 1)?;
                writeln!(f, "{pad}}} THEN {{")?;
                then.render(f, indent + 1)?;
                writeln!(f, "{pad}}} ELSE {{")?;
                otherwise.render(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
            StructuralNode::Repeat { body } => {
                writeln!(f, "{pad}REPEAT {{")?;
                body.render(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
            StructuralNode::While { entry, body } => {
                writeln!(f, "{pad}WHILE {{")?;
                entry.render(f, indent + 1)?;
                writeln!(f, "{pad}}} DO {{")?;
                body.render(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
            StructuralNode::Loop { body } => {
                writeln!(f, "{pad}LOOP {{")?;
                body.render(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
        }
    }
}

impl fmt::Display for StructuralNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

/// Flattens the code blocks of a subgraph in post-order, following
/// successor edges depth-first and skipping back edges. Analyses iterate
/// this ordering for faster fixpoint convergence, but any ordering would
/// converge.
pub fn flatten_post_order(subgraph: &Subgraph) -> Vec<BasicBlockId> {
    let mut marked: BTreeSet<BasicBlockId> = BTreeSet::new();
    let mut working: Vec<BasicBlockId> = Vec::new();
    let mut order = Vec::new();

    for id in subgraph.block_ids() {
        if marked.insert(id) {
            working.push(id);
        }

        while let Some(&top) = working.last() {
            let Some(code) = subgraph.block(top).and_then(BasicBlock::as_code) else {
                // Data and end blocks do not participate in the ordering.
                working.pop();
                continue;
            };

            let mut has_unvisited_child = false;
            for successor in code.successors() {
                let Some(target) = successor.reference().and_then(|r| r.basic_block()) else {
                    continue;
                };
                if marked.insert(target) {
                    working.push(target);
                    has_unvisited_child = true;
                    break;
                }
            }

            if !has_unvisited_child {
                order.push(top);
                working.pop();
            }
        }
    }

    order
}

type NodeId = usize;

const START: NodeId = 0;
const STOP: NodeId = 1;

/// The reduction state: the surviving nodes and the link multimaps in both
/// directions. Links are lists rather than sets so that parallel edges
/// behave like the flow graph they mirror.
struct Reducer {
    nodes: BTreeMap<NodeId, StructuralNode>,
    successors: BTreeMap<NodeId, Vec<NodeId>>,
    predecessors: BTreeMap<NodeId, Vec<NodeId>>,
}

impl Reducer {
    fn add_link(&mut self, from: NodeId, to: NodeId) {
        self.successors.entry(from).or_default().push(to);
        self.predecessors.entry(to).or_default().push(from);
    }

    fn remove_link(&mut self, from: NodeId, to: NodeId) {
        if let Some(list) = self.successors.get_mut(&from) {
            if let Some(position) = list.iter().position(|&n| n == to) {
                list.remove(position);
            }
            if list.is_empty() {
                self.successors.remove(&from);
            }
        }
        if let Some(list) = self.predecessors.get_mut(&to) {
            if let Some(position) = list.iter().position(|&n| n == from) {
                list.remove(position);
            }
            if list.is_empty() {
                self.predecessors.remove(&to);
            }
        }
    }

    fn move_links(&mut self, from: NodeId, to: NodeId) {
        let targets = self.successors.get(&from).cloned().unwrap_or_default();
        for target in targets {
            self.remove_link(from, target);
            self.add_link(to, target);
        }
    }

    fn unique_successor(&self, node: NodeId) -> Option<NodeId> {
        match self.successors.get(&node).map(Vec::as_slice) {
            Some([single]) => Some(*single),
            _ => None,
        }
    }

    fn two_successors(&self, node: NodeId) -> Option<(NodeId, NodeId)> {
        match self.successors.get(&node).map(Vec::as_slice) {
            Some([first, second]) => Some((*first, *second)),
            _ => None,
        }
    }

    fn has_unique_successor(&self, node: NodeId, target: NodeId) -> bool {
        self.unique_successor(node) == Some(target)
    }

    fn has_unique_predecessor(&self, node: NodeId, target: NodeId) -> bool {
        match self.predecessors.get(&node).map(Vec::as_slice) {
            Some([single]) => *single == target,
            _ => false,
        }
    }

    fn take(&mut self, node: NodeId) -> Box<StructuralNode> {
        Box::new(self.nodes.remove(&node).expect("node is active"))
    }

    fn replace(&mut self, node: NodeId, replacement: StructuralNode) {
        self.nodes.insert(node, replacement);
    }

    /// N -> M where M has no other predecessor and is not Stop.
    fn match_sequence(&mut self, node: NodeId) -> bool {
        let Some(tail) = self.unique_successor(node) else {
            return false;
        };
        if !self.has_unique_predecessor(tail, node) || tail == STOP || tail == node {
            return false;
        }

        let replacement = StructuralNode::Sequence {
            entry: self.take(node),
            tail: self.take(tail),
        };
        self.replace(node, replacement);

        self.remove_link(node, tail);
        self.move_links(tail, node);
        true
    }

    /// N -> {Then, End} where Then's only edge leads to End.
    fn match_if_then(&mut self, node: NodeId, swap: bool) -> bool {
        let Some((mut then, mut end)) = self.two_successors(node) else {
            return false;
        };
        if swap {
            core::mem::swap(&mut then, &mut end);
        }
        if !self.has_unique_successor(then, end)
            || !self.has_unique_predecessor(then, node)
            || then == node
        {
            return false;
        }

        let replacement = StructuralNode::IfThen {
            entry: self.take(node),
            then: self.take(then),
        };
        self.replace(node, replacement);

        self.remove_link(node, then);
        self.remove_link(then, end);
        self.remove_link(node, end);
        self.add_link(node, end);
        true
    }

    /// N -> {Then, Else} where both arms join at a common End.
    fn match_if_then_else(&mut self, node: NodeId) -> bool {
        let Some((then, otherwise)) = self.two_successors(node) else {
            return false;
        };
        let Some(end) = self.unique_successor(then) else {
            return false;
        };
        if !self.has_unique_successor(otherwise, end)
            || !self.has_unique_predecessor(then, node)
            || !self.has_unique_predecessor(otherwise, node)
            || node == then
            || node == otherwise
            || then == otherwise
        {
            return false;
        }

        let replacement = StructuralNode::IfThenElse {
            entry: self.take(node),
            then: self.take(then),
            otherwise: self.take(otherwise),
        };
        self.replace(node, replacement);

        self.remove_link(node, then);
        self.remove_link(node, otherwise);
        self.remove_link(then, end);
        self.remove_link(otherwise, end);
        self.add_link(node, end);
        true
    }

    /// N -> {N, End}: a self loop plus an exit.
    fn match_repeat(&mut self, node: NodeId, swap: bool) -> bool {
        let Some((mut body, mut end)) = self.two_successors(node) else {
            return false;
        };
        if swap {
            core::mem::swap(&mut body, &mut end);
        }
        if body != node || body == end {
            return false;
        }

        let replacement = StructuralNode::Repeat {
            body: self.take(node),
        };
        self.replace(node, replacement);

        self.remove_link(node, node);
        self.remove_link(node, end);
        self.add_link(node, end);
        true
    }

    /// N -> {Body, End} where Body's only edge loops back to N.
    fn match_while(&mut self, node: NodeId, swap: bool) -> bool {
        let Some((mut body, mut end)) = self.two_successors(node) else {
            return false;
        };
        if swap {
            core::mem::swap(&mut body, &mut end);
        }
        if !self.has_unique_predecessor(body, node)
            || !self.has_unique_successor(body, node)
            || body == node
        {
            return false;
        }

        let replacement = StructuralNode::While {
            entry: self.take(node),
            body: self.take(body),
        };
        self.replace(node, replacement);

        self.remove_link(node, body);
        self.remove_link(body, node);
        self.remove_link(node, end);
        self.add_link(node, end);
        true
    }

    /// N -> N alone: an infinite loop. A synthetic edge to Stop keeps the
    /// reduced node connected.
    fn match_loop(&mut self, node: NodeId) -> bool {
        let Some(body) = self.unique_successor(node) else {
            return false;
        };
        if body != node {
            return false;
        }

        let replacement = StructuralNode::Loop {
            body: self.take(node),
        };
        self.replace(node, replacement);

        self.remove_link(node, node);
        self.add_link(node, STOP);
        true
    }

    fn reduce(&mut self, node: NodeId) -> bool {
        self.match_sequence(node)
            || self.match_if_then(node, false)
            || self.match_if_then(node, true)
            || self.match_if_then_else(node)
            || self.match_repeat(node, false)
            || self.match_repeat(node, true)
            || self.match_while(node, false)
            || self.match_while(node, true)
            || self.match_loop(node)
    }
}

/// Reduces the subgraph's flow graph to a structural tree.
///
/// On success the returned tree spans every code block, rooted at the sole
/// child of the virtual Start node. Fails with [`Error::Irreducible`] when
/// the fixpoint settles without collapsing the graph to a single node.
pub fn build_structural_tree(subgraph: &Subgraph) -> Result<StructuralNode, Error> {
    let order = flatten_post_order(subgraph);

    let mut reducer = Reducer {
        nodes: BTreeMap::new(),
        successors: BTreeMap::new(),
        predecessors: BTreeMap::new(),
    };
    reducer.nodes.insert(START, StructuralNode::Start);
    reducer.nodes.insert(STOP, StructuralNode::Stop);

    let mut node_of: BTreeMap<BasicBlockId, NodeId> = BTreeMap::new();
    for (position, &block) in order.iter().enumerate() {
        let node = position + 2;
        node_of.insert(block, node);
        reducer.nodes.insert(node, StructuralNode::Base(block));
    }

    // Mirror the flow graph edges between code blocks.
    for &block in &order {
        let code = subgraph
            .block(block)
            .and_then(BasicBlock::as_code)
            .expect("post-order yields code blocks");
        let from = node_of[&block];
        for successor in code.successors() {
            let Some(target) = successor.reference().and_then(|r| r.basic_block()) else {
                continue;
            };
            if let Some(&to) = node_of.get(&target) {
                reducer.add_link(from, to);
            }
        }
    }

    // Every layout entry point flows from Start.
    if subgraph.block_descriptions().is_empty() {
        return Err(Error::InvariantViolated("subgraph has no block descriptions"));
    }
    for description in subgraph.block_descriptions() {
        let Some(&head) = description.basic_block_order.first() else {
            return Err(Error::InvariantViolated("block description lays out no blocks"));
        };
        let Some(&node) = node_of.get(&head) else {
            return Err(Error::InvariantViolated(
                "block description entry is not a code block",
            ));
        };
        reducer.add_link(START, node);
    }

    // Connect dangling nodes to the virtual boundary nodes.
    for &block in &order {
        let node = node_of[&block];
        if !reducer.successors.contains_key(&node) {
            reducer.add_link(node, STOP);
        }
        if !reducer.predecessors.contains_key(&node) {
            reducer.add_link(START, node);
        }
    }

    // Fixpoint reduction; the number of active nodes shrinks on every
    // successful match, which bounds the iteration.
    let base_nodes: Vec<NodeId> = (2..2 + order.len()).collect();
    let mut changed = true;
    while changed {
        changed = false;
        for &node in &base_nodes {
            while reducer.nodes.contains_key(&node) && reducer.reduce(node) {
                changed = true;
            }
        }
    }

    // The graph must have collapsed to Start -> tree -> Stop.
    let active: Vec<NodeId> = reducer
        .nodes
        .keys()
        .copied()
        .filter(|&n| n != START && n != STOP)
        .collect();
    if let [root] = active.as_slice() {
        let root = *root;
        if reducer.has_unique_successor(START, root)
            && reducer.has_unique_predecessor(root, START)
            && reducer.has_unique_successor(root, STOP)
            && reducer.has_unique_predecessor(STOP, root)
        {
            return Ok(*reducer.take(root));
        }
    }

    tracing::warn!(active = active.len(), "flow graph did not reduce");
    Err(Error::Irreducible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BasicBlockReference, Condition, ReferenceType, Successor};
    use crate::subgraph::BlockType;

    fn jump(subgraph: &mut Subgraph, from: BasicBlockId, to: BasicBlockId) {
        let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, to);
        subgraph
            .append_successor(from, Successor::new(Condition::True, reference, 5))
            .unwrap();
    }

    fn branch(
        subgraph: &mut Subgraph,
        from: BasicBlockId,
        taken: BasicBlockId,
        fallthrough: BasicBlockId,
    ) {
        let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, taken);
        subgraph
            .append_successor(from, Successor::new(Condition::Equal, reference, 6))
            .unwrap();
        let reference =
            BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, fallthrough);
        subgraph
            .append_successor(from, Successor::new(Condition::NotEqual, reference, 5))
            .unwrap();
    }

    fn describe(subgraph: &mut Subgraph, entry: BasicBlockId) {
        subgraph.add_block_description("f", BlockType::Code, 1, vec![entry]);
    }

    #[test]
    fn a_straight_line_reduces_to_a_sequence() {
        let mut subgraph = Subgraph::new();
        let b0 = subgraph.add_code_block("b0");
        let b1 = subgraph.add_code_block("b1");
        jump(&mut subgraph, b0, b1);
        describe(&mut subgraph, b0);

        let tree = build_structural_tree(&subgraph).unwrap();
        assert_eq!(
            StructuralNode::Sequence {
                entry: Box::new(StructuralNode::Base(b0)),
                tail: Box::new(StructuralNode::Base(b1)),
            },
            tree
        );
    }

    #[test]
    fn a_diamond_reduces_to_if_then_else() {
        let mut subgraph = Subgraph::new();
        let entry = subgraph.add_code_block("entry");
        let then = subgraph.add_code_block("then");
        let otherwise = subgraph.add_code_block("else");
        let join = subgraph.add_code_block("join");
        branch(&mut subgraph, entry, then, otherwise);
        jump(&mut subgraph, then, join);
        jump(&mut subgraph, otherwise, join);
        describe(&mut subgraph, entry);

        let tree = build_structural_tree(&subgraph).unwrap();
        match tree {
            StructuralNode::Sequence { entry: head, tail } => {
                assert!(matches!(*head, StructuralNode::IfThenElse { .. }));
                assert_eq!(StructuralNode::Base(join), *tail);
            }
            other => panic!("expected a sequence, got:\n{other}"),
        }
    }

    #[test]
    fn a_skip_edge_reduces_to_if_then() {
        let mut subgraph = Subgraph::new();
        let entry = subgraph.add_code_block("entry");
        let then = subgraph.add_code_block("then");
        let join = subgraph.add_code_block("join");
        branch(&mut subgraph, entry, then, join);
        jump(&mut subgraph, then, join);
        describe(&mut subgraph, entry);

        let tree = build_structural_tree(&subgraph).unwrap();
        match tree {
            StructuralNode::Sequence { entry: head, tail } => {
                assert!(matches!(*head, StructuralNode::IfThen { .. }));
                assert_eq!(StructuralNode::Base(join), *tail);
            }
            other => panic!("expected a sequence, got:\n{other}"),
        }
    }

    #[test]
    fn a_self_loop_reduces_to_repeat() {
        let mut subgraph = Subgraph::new();
        let entry = subgraph.add_code_block("entry");
        let exit = subgraph.add_code_block("exit");
        branch(&mut subgraph, entry, entry, exit);
        describe(&mut subgraph, entry);

        let tree = build_structural_tree(&subgraph).unwrap();
        assert_eq!(
            StructuralNode::Sequence {
                entry: Box::new(StructuralNode::Repeat {
                    body: Box::new(StructuralNode::Base(entry)),
                }),
                tail: Box::new(StructuralNode::Base(exit)),
            },
            tree
        );
    }

    #[test]
    fn a_guarded_back_edge_reduces_to_while() {
        let mut subgraph = Subgraph::new();
        let guard = subgraph.add_code_block("guard");
        let body = subgraph.add_code_block("body");
        let exit = subgraph.add_code_block("exit");
        branch(&mut subgraph, guard, body, exit);
        jump(&mut subgraph, body, guard);
        describe(&mut subgraph, guard);

        let tree = build_structural_tree(&subgraph).unwrap();
        assert_eq!(
            StructuralNode::Sequence {
                entry: Box::new(StructuralNode::While {
                    entry: Box::new(StructuralNode::Base(guard)),
                    body: Box::new(StructuralNode::Base(body)),
                }),
                tail: Box::new(StructuralNode::Base(exit)),
            },
            tree
        );
    }

    #[test]
    fn an_infinite_loop_reduces_to_loop() {
        let mut subgraph = Subgraph::new();
        let spin = subgraph.add_code_block("spin");
        jump(&mut subgraph, spin, spin);
        describe(&mut subgraph, spin);

        let tree = build_structural_tree(&subgraph).unwrap();
        assert_eq!(
            StructuralNode::Loop {
                body: Box::new(StructuralNode::Base(spin)),
            },
            tree
        );
    }

    #[test]
    fn a_two_entry_loop_is_irreducible() {
        let mut subgraph = Subgraph::new();
        let entry = subgraph.add_code_block("entry");
        let left = subgraph.add_code_block("left");
        let right = subgraph.add_code_block("right");
        branch(&mut subgraph, entry, left, right);
        jump(&mut subgraph, left, right);
        jump(&mut subgraph, right, left);
        describe(&mut subgraph, entry);

        assert_eq!(Err(Error::Irreducible), build_structural_tree(&subgraph));
    }

    #[test]
    fn post_order_visits_successors_first() {
        let mut subgraph = Subgraph::new();
        let entry = subgraph.add_code_block("entry");
        let then = subgraph.add_code_block("then");
        let join = subgraph.add_code_block("join");
        branch(&mut subgraph, entry, then, join);
        jump(&mut subgraph, then, join);
        describe(&mut subgraph, entry);

        let order = flatten_post_order(&subgraph);
        assert_eq!(3, order.len());
        let position = |id| order.iter().position(|&b| b == id).unwrap();
        assert!(position(join) < position(then));
        assert!(position(then) < position(entry));
    }

    #[test]
    fn rendering_names_the_region_operators() {
        let mut subgraph = Subgraph::new();
        let guard = subgraph.add_code_block("guard");
        let body = subgraph.add_code_block("body");
        let exit = subgraph.add_code_block("exit");
        branch(&mut subgraph, guard, body, exit);
        jump(&mut subgraph, body, guard);
        describe(&mut subgraph, guard);

        let rendered = build_structural_tree(&subgraph).unwrap().to_string();
        assert!(rendered.contains("WHILE {"));
        assert!(rendered.contains("} DO {"));
    }
}
