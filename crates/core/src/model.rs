use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    graph::Graph,
    node::{Node, NodeId},
    value::ValueId,
};

#[derive(Default, Clone)]
pub struct Model {
    pub graph: Graph,
}

impl Model {
    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.graph.add_node(node)
    }

    /// Consumers of each value. Deleted nodes are invisible.
    pub fn get_value_users(&self) -> FxHashMap<ValueId, FxHashSet<NodeId>> {
        let mut value_users: FxHashMap<ValueId, FxHashSet<NodeId>> = FxHashMap::default();

        for (node_id, node) in self.graph.nodes.iter() {
            if node.deleted {
                continue;
            }
            for &input in node.inputs.iter() {
                value_users.entry(input).or_default().insert(node_id);
            }
        }

        value_users
    }

    /// The sole producer of each value (single static assignment).
    /// Initializers and graph inputs have no parent.
    pub fn get_value_parents(&self) -> FxHashMap<ValueId, NodeId> {
        let mut value_parents = FxHashMap::default();

        for (node_id, node) in self.graph.nodes.iter() {
            if node.deleted {
                continue;
            }
            for &output in node.outputs.iter() {
                value_parents.insert(output, node_id);
            }
        }

        value_parents
    }

    pub fn topo_sort_nodes(&self) -> Vec<NodeId> {
        let value_users = self.get_value_users();
        let value_parents = self.get_value_parents();

        let mut nodes = vec![];
        let mut num_unresolved = FxHashMap::default();
        let mut que = vec![];

        for (id, node) in self.graph.nodes.iter() {
            if node.deleted {
                continue;
            }
            let unresolved = node
                .inputs
                .iter()
                .collect::<FxHashSet<_>>()
                .into_iter()
                .filter(|input| value_parents.contains_key(input))
                .count();
            if unresolved == 0 {
                que.push(id);
            } else {
                num_unresolved.insert(id, unresolved);
            }
        }

        while let Some(id) = que.pop() {
            nodes.push(id);
            for output in self.graph.nodes[id].outputs.iter() {
                let Some(users) = value_users.get(output) else {
                    continue;
                };
                for &user in users {
                    let n = num_unresolved.get_mut(&user).unwrap();
                    *n -= 1;
                    if *n == 0 {
                        que.push(user);
                    }
                }
            }
        }

        nodes
    }

    /// Marks nodes unreachable from the graph outputs as deleted. Run after a
    /// rewrite pass leaves orphans behind.
    pub fn remove_unnecessary_nodes(&mut self) {
        let value_parents = self.get_value_parents();

        let mut live = FxHashSet::default();
        let mut stack: Vec<NodeId> = self
            .graph
            .outputs
            .iter()
            .filter_map(|output| value_parents.get(output).copied())
            .collect();
        while let Some(id) = stack.pop() {
            if !live.insert(id) {
                continue;
            }
            for input in self.graph.nodes[id].inputs.iter() {
                if let Some(&parent) = value_parents.get(input) {
                    stack.push(parent);
                }
            }
        }

        let dead = self
            .graph
            .nodes
            .iter()
            .filter(|(id, node)| !node.deleted && !live.contains(id))
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        for id in dead {
            log::debug!(
                "removing dead node: {}",
                self.graph.nodes[id]
                    .name
                    .as_deref()
                    .unwrap_or(self.graph.nodes[id].op.name())
            );
            self.graph.nodes[id].deleted = true;
        }
    }
}

#[cfg(test)]
fn simple_conv_relu_model() -> (Model, NodeId, NodeId) {
    use crate::{
        op::{Conv2d, Op},
        tensor::Tensor,
    };

    let mut m = Model::default();
    let x = m.graph.values.new_val_named("x");
    let w = m.graph.values.new_val_named("w");
    let conv_out = m.graph.values.new_val();
    let relu_out = m.graph.values.new_val();
    let conv = m.add_node(
        Node::new(Op::Conv2d(Conv2d {
            kernel_shape: vec![3, 3].into(),
            strides: vec![1, 1].into(),
            padding: vec![0, 0].into(),
            dilations: vec![1, 1].into(),
            group: 1,
            ..Default::default()
        }))
        .with_ins(vec![x, w])
        .with_out(conv_out),
    );
    let relu = m.add_node(Node::new(Op::ReLU).with_in(conv_out).with_out(relu_out));
    m.graph.inputs.push(x);
    m.graph.outputs.push(relu_out);
    m.graph
        .inits
        .insert(w, Tensor::zeros::<f32>(vec![4, 3, 3, 3].into()));
    (m, conv, relu)
}

#[test]
fn topo_sort_orders_producers_first() {
    let (m, conv, relu) = simple_conv_relu_model();
    assert_eq!(m.topo_sort_nodes(), vec![conv, relu]);
}

#[test]
fn value_users_and_parents() {
    let (m, conv, relu) = simple_conv_relu_model();
    let users = m.get_value_users();
    let parents = m.get_value_parents();
    let conv_out = m.graph.nodes[conv].outputs[0];
    assert_eq!(users[&conv_out].len(), 1);
    assert!(users[&conv_out].contains(&relu));
    assert_eq!(parents[&conv_out], conv);
}

#[test]
fn deleted_nodes_are_invisible() {
    let (mut m, conv, relu) = simple_conv_relu_model();
    m.graph.nodes[relu].deleted = true;
    let conv_out = m.graph.nodes[conv].outputs[0];
    assert!(!m.get_value_users().contains_key(&conv_out));
    assert_eq!(m.topo_sort_nodes(), vec![conv]);
}

#[test]
fn dead_node_sweep() {
    use crate::op::Op;

    let (mut m, conv, relu) = simple_conv_relu_model();
    // An Add dangling off the conv output, feeding nothing.
    let conv_out = m.graph.nodes[conv].outputs[0];
    let dangling_out = m.graph.values.new_val();
    let dangling = m.add_node(
        Node::new(Op::Add)
            .with_ins(vec![conv_out, conv_out])
            .with_out(dangling_out),
    );
    m.remove_unnecessary_nodes();
    assert!(m.graph.nodes[dangling].deleted);
    assert!(!m.graph.nodes[conv].deleted);
    assert!(!m.graph.nodes[relu].deleted);
}
