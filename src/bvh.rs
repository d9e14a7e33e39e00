use anyhow::{bail, Result};
use bytemuck::{Pod, Zeroable};

use crate::aabb::Aabb;
use crate::triangle::Triangle;

/// Most triangles a leaf may carry.
pub const DEFAULT_LEAF_SIZE: usize = 4;

#[derive(Debug)]
pub enum NodeKind {
    Internal {
        axis: usize,
        split: usize,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        triangles: Vec<u32>,
    },
}

#[derive(Debug)]
pub struct Node {
    pub bounds: Aabb,
    pub kind: NodeKind,
}

pub struct Bvh {
    pub root: Node,
    pub depth: u32,
    pub node_count: usize,
    pub leaf_size: usize,
}

/// One node of the flattened tree in depth-first preorder. The three index
/// cells share 32-bit storage with the float cells downstream; `pack_bvh`
/// moves them across with their bit patterns intact.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FlatNode {
    pub left: i32,
    pub right: i32,
    pub triangle_base: i32,
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
}

pub struct FlatBvh {
    pub nodes: Vec<FlatNode>,
    /// Triangle ids in leaf-visit order; a leaf's `triangle_base` indexes
    /// into this list.
    pub triangle_order: Vec<u32>,
}

pub struct BvhBuilder<'a> {
    triangles: &'a [Triangle],
    leaf_size: usize,
    left_mask: Vec<bool>,
    front_area: Vec<f32>,
    back_area: Vec<f32>,
    depth: u32,
    node_count: usize,
}

impl<'a> BvhBuilder<'a> {
    pub fn new(triangles: &'a [Triangle]) -> Self {
        Self {
            triangles,
            leaf_size: DEFAULT_LEAF_SIZE,
            left_mask: Vec::new(),
            front_area: Vec::new(),
            back_area: Vec::new(),
            depth: 0,
            node_count: 0,
        }
    }

    pub fn leaf_size(mut self, leaf_size: usize) -> Self {
        self.leaf_size = leaf_size.max(1);
        self
    }

    pub fn build(mut self) -> Result<Bvh> {
        if self.triangles.is_empty() {
            bail!("cannot build a BVH over an empty triangle set");
        }

        let count = self.triangles.len();
        self.left_mask = vec![false; count];
        self.front_area = vec![0.0; count];
        self.back_area = vec![0.0; count];

        // One index list per axis, sorted ascending by box centroid. These
        // survive partitioning, so the O(n log n) sort happens exactly once.
        let mut order: [Vec<u32>; 3] = Default::default();
        for (axis, list) in order.iter_mut().enumerate() {
            *list = (0..count as u32).collect();
            list.sort_by(|&a, &b| {
                self.triangles[a as usize]
                    .centroid(axis)
                    .total_cmp(&self.triangles[b as usize].centroid(axis))
            });
        }

        let leaf_size = self.leaf_size;
        let root = self.split_node(order, 0);
        Ok(Bvh {
            root,
            depth: self.depth,
            node_count: self.node_count,
            leaf_size,
        })
    }

    fn split_node(&mut self, order: [Vec<u32>; 3], depth: u32) -> Node {
        self.node_count += 1;
        let count = order[0].len();

        let mut bounds = Aabb::EMPTY;
        for &t in &order[0] {
            bounds.grow_aabb(self.triangles[t as usize].bounds());
        }

        if count <= self.leaf_size {
            self.depth = self.depth.max(depth);
            let [triangles, _, _] = order;
            return Node {
                bounds,
                kind: NodeKind::Leaf { triangles },
            };
        }

        let (axis, split) = self.select_split(&order, &bounds);

        // Partition the winning axis at `split`; the other two lists keep
        // their sort order by filtering against the left membership mask.
        for &t in &order[axis][..split] {
            self.left_mask[t as usize] = true;
        }
        let mut left: [Vec<u32>; 3] = Default::default();
        let mut right: [Vec<u32>; 3] = Default::default();
        for a in 0..3 {
            if a == axis {
                left[a] = order[a][..split].to_vec();
                right[a] = order[a][split..].to_vec();
            } else {
                left[a] = Vec::with_capacity(split);
                right[a] = Vec::with_capacity(count - split);
                for &t in &order[a] {
                    if self.left_mask[t as usize] {
                        left[a].push(t);
                    } else {
                        right[a].push(t);
                    }
                }
            }
        }
        for &t in &order[axis][..split] {
            self.left_mask[t as usize] = false;
        }

        let left_child = self.split_node(left, depth + 1);
        let right_child = self.split_node(right, depth + 1);
        Node {
            bounds,
            kind: NodeKind::Internal {
                axis,
                split,
                left: Box::new(left_child),
                right: Box::new(right_child),
            },
        }
    }

    /// Exact SAH sweep. For each axis, prefix and suffix box areas are
    /// accumulated over the sorted list, then every split position is
    /// costed. The first strict minimum in (axis, split) iteration order
    /// wins, which keeps degenerate ties deterministic.
    fn select_split(&mut self, order: &[Vec<u32>; 3], bounds: &Aabb) -> (usize, usize) {
        let count = order[0].len();
        let parent_area = bounds.surface_area();

        let mut best = (0, 1);
        let mut best_cost = f32::INFINITY;
        for (axis, list) in order.iter().enumerate() {
            let mut front = Aabb::EMPTY;
            for (i, &t) in list.iter().enumerate() {
                front.grow_aabb(self.triangles[t as usize].bounds());
                self.front_area[i] = front.surface_area();
            }
            let mut back = Aabb::EMPTY;
            for i in (0..count).rev() {
                back.grow_aabb(self.triangles[list[i] as usize].bounds());
                self.back_area[i] = back.surface_area();
            }

            for split in 1..count {
                let cost = 1.0
                    + (self.front_area[split - 1] * split as f32
                        + self.back_area[split] * (count - split) as f32)
                        / parent_area;
                if cost < best_cost {
                    best_cost = cost;
                    best = (axis, split);
                }
            }
        }
        best
    }
}

impl Bvh {
    /// Depth-first preorder flattening. Ordinals are assigned on first
    /// visit, so the root lands at 0 and each internal node's subtrees
    /// occupy contiguous ordinal ranges.
    pub fn flatten(&self) -> FlatBvh {
        let mut flat = FlatBvh {
            nodes: Vec::with_capacity(self.node_count),
            triangle_order: Vec::new(),
        };
        flatten_into(&self.root, &mut flat);
        flat
    }
}

fn flatten_into(node: &Node, flat: &mut FlatBvh) -> i32 {
    let ordinal = flat.nodes.len() as i32;
    flat.nodes.push(FlatNode {
        left: -1,
        right: -1,
        triangle_base: -1,
        bounds_min: node.bounds.min.to_array(),
        bounds_max: node.bounds.max.to_array(),
    });
    match &node.kind {
        NodeKind::Leaf { triangles } => {
            flat.nodes[ordinal as usize].triangle_base = flat.triangle_order.len() as i32;
            flat.triangle_order.extend_from_slice(triangles);
        }
        NodeKind::Internal { left, right, .. } => {
            let left_ordinal = flatten_into(left, flat);
            let right_ordinal = flatten_into(right, flat);
            let record = &mut flat.nodes[ordinal as usize];
            record.left = left_ordinal;
            record.right = right_ordinal;
        }
    }
    ordinal
}
