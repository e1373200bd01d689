//! Message forest reconstruction and active-branch bookkeeping.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::core::message::{Message, ROOT_PID};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("message id {0} appears more than once")]
    DuplicateId(String),
    #[error("message {id} references missing parent {pid}")]
    Orphan { id: String, pid: String },
    #[error("messages {0:?} form a parent cycle")]
    Cycle(Vec<String>),
    #[error("message {0} does not exist")]
    UnknownMessage(String),
}

#[derive(Debug)]
pub struct ForestNode<'a> {
    pub message: &'a Message,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub depth: usize,
}

/// Arena view over a conversation's messages, linked by `pid`.
///
/// Siblings keep the order in which they appear in the input slice.
#[derive(Debug)]
pub struct MessageForest<'a> {
    nodes: Vec<ForestNode<'a>>,
    roots: Vec<usize>,
    index: HashMap<&'a str, usize>,
}

impl<'a> MessageForest<'a> {
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn node(&self, index: usize) -> &ForestNode<'a> {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Indices from the root down to `index`, inclusive.
    pub fn path_to(&self, index: usize) -> Vec<usize> {
        let mut path = vec![index];
        let mut cursor = self.nodes[index].parent;
        while let Some(parent) = cursor {
            path.push(parent);
            cursor = self.nodes[parent].parent;
        }
        path.reverse();
        path
    }

    /// Pre-order traversal over every tree, roots in input order.
    pub fn depth_first(&self) -> Vec<&'a Message> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            order.push(node.message);
            stack.extend(node.children.iter().rev().copied());
        }
        order
    }
}

/// Rebuilds the forest from `(id, pid)` links.
///
/// Every message ends up exactly once in the result, either as a root or
/// under its parent. Duplicate ids, dangling parents and cycles are errors.
pub fn build_forest(messages: &[Message]) -> Result<MessageForest<'_>, TreeError> {
    let mut index = HashMap::with_capacity(messages.len());
    for (position, message) in messages.iter().enumerate() {
        if index.insert(message.id.as_str(), position).is_some() {
            return Err(TreeError::DuplicateId(message.id.clone()));
        }
    }

    let mut nodes: Vec<ForestNode<'_>> = messages
        .iter()
        .map(|message| ForestNode {
            message,
            parent: None,
            children: Vec::new(),
            depth: 0,
        })
        .collect();
    let mut roots = Vec::new();

    for (position, message) in messages.iter().enumerate() {
        if message.pid == ROOT_PID {
            roots.push(position);
            continue;
        }
        let parent = *index
            .get(message.pid.as_str())
            .ok_or_else(|| TreeError::Orphan {
                id: message.id.clone(),
                pid: message.pid.clone(),
            })?;
        nodes[position].parent = Some(parent);
        nodes[parent].children.push(position);
    }

    // Anything not reachable from a root sits on a parent cycle.
    let mut reached = vec![false; nodes.len()];
    let mut queue: VecDeque<usize> = roots.iter().copied().collect();
    for root in &roots {
        reached[*root] = true;
    }
    while let Some(current) = queue.pop_front() {
        let depth = nodes[current].depth + 1;
        let children = nodes[current].children.clone();
        for child in children {
            reached[child] = true;
            nodes[child].depth = depth;
            queue.push_back(child);
        }
    }

    let cyclic: Vec<String> = reached
        .iter()
        .enumerate()
        .filter(|(_, seen)| !**seen)
        .map(|(position, _)| messages[position].id.clone())
        .collect();
    if !cyclic.is_empty() {
        return Err(TreeError::Cycle(cyclic));
    }

    Ok(MessageForest {
        nodes,
        roots,
        index,
    })
}

/// Messages on the active branch, root first.
///
/// Picks the last active root, then repeatedly descends into the last active
/// child. An empty conversation yields an empty path.
pub fn active_path(messages: &[Message]) -> Result<Vec<&Message>, TreeError> {
    let forest = build_forest(messages)?;
    let pick_active = |candidates: &[usize]| {
        candidates
            .iter()
            .rev()
            .copied()
            .find(|index| forest.node(*index).message.is_active)
    };

    let mut path = Vec::new();
    let mut cursor = pick_active(forest.roots());
    while let Some(index) = cursor {
        let node = forest.node(index);
        path.push(node.message);
        cursor = pick_active(&node.children);
    }
    Ok(path)
}

/// Makes `message_id` part of the active branch.
///
/// The target and each of its ancestors become active while their siblings
/// are deactivated. Descendants keep their flags so a previously chosen
/// sub-branch is restored when switching back.
pub fn switch_branch(messages: &mut [Message], message_id: &str) -> Result<(), TreeError> {
    let (path_ids, sibling_sets) = {
        let forest = build_forest(messages)?;
        let target = forest
            .find(message_id)
            .ok_or_else(|| TreeError::UnknownMessage(message_id.to_string()))?;
        let path = forest.path_to(target);
        let path_ids: Vec<String> = path
            .iter()
            .map(|index| forest.node(*index).message.id.clone())
            .collect();
        let sibling_sets: Vec<String> = path
            .iter()
            .flat_map(|index| {
                let siblings = match forest.node(*index).parent {
                    Some(parent) => forest.node(parent).children.as_slice(),
                    None => forest.roots(),
                };
                siblings
                    .iter()
                    .filter(|sibling| *sibling != index)
                    .map(|sibling| forest.node(*sibling).message.id.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        (path_ids, sibling_sets)
    };

    for message in messages.iter_mut() {
        if path_ids.contains(&message.id) {
            message.is_active = true;
        } else if sibling_sets.contains(&message.id) {
            message.is_active = false;
        }
    }
    Ok(())
}
