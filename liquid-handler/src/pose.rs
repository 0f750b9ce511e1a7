//! Tree of tracked physical objects.
//!
//! Every object on the robot (deck, slots, labware, wells, gantry, mounts,
//! instruments, tips) is a node holding an offset and orientation relative
//! to its parent. Absolute positions are composed on demand by walking from
//! the root, so moving a parent implicitly moves everything below it.

use std::collections::HashMap;
use std::fmt;

use nalgebra::{Matrix3, Matrix4};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Point;

/// Opaque handle to a node in a [`PoseGraph`].
///
/// Handles are only minted by [`PoseGraph::allocate_id`] and are never reused,
/// even after [`PoseGraph::clear_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("object {0} is not tracked")]
    NotTracked(ObjectId),
    #[error("object {0} is already tracked")]
    AlreadyTracked(ObjectId),
    #[error("cannot attach {child} to untracked parent {parent}")]
    ParentNotTracked { parent: ObjectId, child: ObjectId },
}

pub type PoseResult<T> = Result<T, PoseError>;

/// Absolute position and orientation of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Point,
    pub orientation: Matrix3<f64>,
}

impl Pose {
    pub fn x(&self) -> f64 {
        self.position.x
    }

    pub fn y(&self) -> f64 {
        self.position.y
    }

    pub fn z(&self) -> f64 {
        self.position.z
    }

    /// Homogeneous transform from the object's frame to the world frame.
    pub fn transform(&self) -> Matrix4<f64> {
        homogeneous(&self.position, &self.orientation)
    }

    fn from_transform(m: &Matrix4<f64>) -> Self {
        Self {
            position: Point::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]),
            orientation: m.fixed_view::<3, 3>(0, 0).into_owned(),
        }
    }
}

#[derive(Debug, Clone)]
struct PoseNode {
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
    offset: Point,
    orientation: Matrix3<f64>,
}

impl PoseNode {
    fn local_transform(&self) -> Matrix4<f64> {
        homogeneous(&self.offset, &self.orientation)
    }
}

fn homogeneous(offset: &Point, orientation: &Matrix3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(orientation);
    m[(0, 3)] = offset.x;
    m[(1, 3)] = offset.y;
    m[(2, 3)] = offset.z;
    m
}

/// Registry of tracked objects and their parent-relative offsets.
#[derive(Debug, Clone, Default)]
pub struct PoseGraph {
    nodes: HashMap<ObjectId, PoseNode>,
    next_id: u64,
}

impl PoseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh handle. The handle is not tracked until it is registered.
    pub fn allocate_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Register a parentless node at an absolute position.
    pub fn create_root_object(&mut self, id: ObjectId, position: Point) -> PoseResult<()> {
        if self.nodes.contains_key(&id) {
            return Err(PoseError::AlreadyTracked(id));
        }
        self.nodes.insert(
            id,
            PoseNode {
                parent: None,
                children: Vec::new(),
                offset: position,
                orientation: Matrix3::identity(),
            },
        );
        Ok(())
    }

    /// Register `child` under `parent` at `offset` in the parent's frame.
    pub fn track_object(&mut self, parent: ObjectId, child: ObjectId, offset: Point) -> PoseResult<()> {
        self.track_object_oriented(parent, child, offset, Matrix3::identity())
    }

    pub fn track_object_oriented(
        &mut self,
        parent: ObjectId,
        child: ObjectId,
        offset: Point,
        orientation: Matrix3<f64>,
    ) -> PoseResult<()> {
        if self.nodes.contains_key(&child) {
            return Err(PoseError::AlreadyTracked(child));
        }
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or(PoseError::ParentNotTracked { parent, child })?;
        parent_node.children.push(child);
        self.nodes.insert(
            child,
            PoseNode {
                parent: Some(parent),
                children: Vec::new(),
                offset,
                orientation,
            },
        );
        Ok(())
    }

    fn node(&self, id: ObjectId) -> PoseResult<&PoseNode> {
        self.nodes.get(&id).ok_or(PoseError::NotTracked(id))
    }

    fn node_mut(&mut self, id: ObjectId) -> PoseResult<&mut PoseNode> {
        self.nodes.get_mut(&id).ok_or(PoseError::NotTracked(id))
    }

    /// Absolute pose: the composition of local transforms from the root down.
    pub fn get(&self, id: ObjectId) -> PoseResult<Pose> {
        Ok(Pose::from_transform(&self.absolute_transform(id)?))
    }

    fn absolute_transform(&self, id: ObjectId) -> PoseResult<Matrix4<f64>> {
        let mut node = self.node(id)?;
        let mut transform = node.local_transform();
        while let Some(parent) = node.parent {
            node = self.node(parent)?;
            transform = node.local_transform() * transform;
        }
        Ok(transform)
    }

    pub fn parent(&self, id: ObjectId) -> PoseResult<Option<ObjectId>> {
        Ok(self.node(id)?.parent)
    }

    pub fn children(&self, id: ObjectId) -> PoseResult<&[ObjectId]> {
        Ok(&self.node(id)?.children)
    }

    pub fn local_offset(&self, id: ObjectId) -> PoseResult<Point> {
        Ok(self.node(id)?.offset)
    }

    /// Shift a node (and so its whole subtree) by `delta` in its parent's frame.
    pub fn translate_object(&mut self, id: ObjectId, delta: Point) -> PoseResult<()> {
        self.node_mut(id)?.offset += delta;
        Ok(())
    }

    pub fn set_local_offset(&mut self, id: ObjectId, offset: Point) -> PoseResult<()> {
        self.node_mut(id)?.offset = offset;
        Ok(())
    }

    /// True if `ancestor` lies on the path from `id` to its root. A node is
    /// not its own ancestor.
    pub fn is_descendant(&self, id: ObjectId, ancestor: ObjectId) -> bool {
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.nodes.get(&parent).and_then(|n| n.parent);
        }
        false
    }

    /// Every node below `id`, depth first. `id` itself is not included.
    pub fn descendants(&self, id: ObjectId) -> PoseResult<Vec<ObjectId>> {
        let mut out = Vec::new();
        let mut stack: Vec<ObjectId> = self.node(id)?.children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.nodes.get(&next) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        Ok(out)
    }

    /// Highest absolute z over `id` and everything below it.
    pub fn max_z_in_subtree(&self, id: ObjectId) -> PoseResult<f64> {
        let parent_transform = match self.node(id)?.parent {
            Some(parent) => self.absolute_transform(parent)?,
            None => Matrix4::identity(),
        };
        let mut max_z = f64::NEG_INFINITY;
        let mut stack = vec![(id, parent_transform)];
        while let Some((next, parent_transform)) = stack.pop() {
            let node = self.node(next)?;
            let transform = parent_transform * node.local_transform();
            max_z = max_z.max(transform[(2, 3)]);
            for child in &node.children {
                stack.push((*child, transform));
            }
        }
        Ok(max_z)
    }

    /// Remove a node and its subtree, returning every removed handle.
    pub fn remove_object(&mut self, id: ObjectId) -> PoseResult<Vec<ObjectId>> {
        let mut removed = vec![id];
        removed.extend(self.descendants(id)?);

        if let Some(parent) = self.node(id)?.parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|c| *c != id);
            }
        }
        for gone in &removed {
            self.nodes.remove(gone);
        }
        Ok(removed)
    }

    /// Forget every node. Handles minted afterwards never collide with old ones.
    pub fn clear_all(&mut self) {
        self.nodes.clear();
    }
}
