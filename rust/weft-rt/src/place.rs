//! The place tree: worker seats, per-place deques, and steal order.
//!
//! A topology is an immutable tree of places. Each place carries one work
//! deque **per worker**, so every (place, worker) pair has a single owner
//! and the deque's push/pop contract holds without extra locking: a task
//! spawned at place `P` by worker `w` lands in `P`'s deque for `w`, and a
//! task spawned without a place lands in the home-place deque of the
//! spawning worker.
//!
//! # Descriptor format
//!
//! The descriptor is TOML, one `[[place]]` entry per place, referenced by
//! array index:
//!
//! ```toml
//! [[place]]            # index 0: the root
//! workers = 0
//!
//! [[place]]            # index 1
//! parent = 0
//! workers = 2
//!
//! [[place]]            # index 2
//! parent = 0
//! workers = 2
//! ```
//!
//! Worker ids are assigned in place declaration order, seat by seat.
//!
//! # Steal order
//!
//! The victim order for each worker is deterministic given the topology:
//! the home place first, then the home's subtree in preorder, then each
//! ancestor in turn followed by that ancestor's still-unvisited subtrees in
//! declaration order. Within a place, victim deques are visited in worker
//! order starting just after the thief's own id; the thief's own home deque
//! is excluded (its `pop` already covers it).

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::deque::WorkDeque;
use crate::task::Task;

// ---------------------------------------------------------------------------
// Identifiers and errors
// ---------------------------------------------------------------------------

/// Index of a place in the topology tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaceId(pub(crate) usize);

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "place#{}", self.0)
    }
}

/// Problems with a topology descriptor.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read topology descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse topology descriptor: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("topology has no places")]
    NoPlaces,
    #[error("topology must have exactly one root place, found {0}")]
    RootCount(usize),
    #[error("place {place} references out-of-range parent {parent}")]
    BadParent { place: usize, parent: usize },
    #[error("place {0} is not reachable from the root (parent cycle)")]
    Unreachable(usize),
    #[error("topology seats no workers")]
    NoWorkers,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// One `[[place]]` entry in the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlaceDesc {
    /// Index of the parent place; absent on the root.
    pub parent: Option<usize>,
    /// Number of worker seats attached to this place.
    #[serde(default)]
    pub workers: usize,
}

/// Parsed topology descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopologyDesc {
    #[serde(rename = "place", default)]
    pub places: Vec<PlaceDesc>,
}

impl TopologyDesc {
    /// Parse a descriptor from TOML text.
    pub fn parse(text: &str) -> Result<Self, TopologyError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a descriptor file.
    pub fn from_file(path: &Path) -> Result<Self, TopologyError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// A single root place seating `workers` workers. This is the shape an
    /// auto-generated descriptor has on a flat machine.
    pub fn flat(workers: usize) -> Self {
        Self {
            places: vec![PlaceDesc {
                parent: None,
                workers,
            }],
        }
    }

    /// Total worker seats across all places.
    pub fn total_workers(&self) -> usize {
        self.places.iter().map(|p| p.workers).sum()
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

pub(crate) struct Place {
    parent: Option<PlaceId>,
    children: Vec<PlaceId>,
    /// One deque per worker; `deques[w]` is owned by worker `w`.
    deques: Vec<WorkDeque<Box<Task>>>,
}

impl Place {
    pub(crate) fn deque(&self, worker: usize) -> &WorkDeque<Box<Task>> {
        &self.deques[worker]
    }
}

/// The immutable place tree plus worker seating.
pub(crate) struct Topology {
    places: Vec<Place>,
    root: PlaceId,
    /// Home place of each worker, indexed by worker id.
    homes: Vec<PlaceId>,
}

impl Topology {
    pub(crate) fn build(desc: &TopologyDesc, deque_capacity: usize) -> Result<Self, TopologyError> {
        if desc.places.is_empty() {
            return Err(TopologyError::NoPlaces);
        }

        let roots: Vec<usize> = desc
            .places
            .iter()
            .enumerate()
            .filter(|(_, p)| p.parent.is_none())
            .map(|(i, _)| i)
            .collect();
        if roots.len() != 1 {
            return Err(TopologyError::RootCount(roots.len()));
        }
        let root = PlaceId(roots[0]);

        for (i, p) in desc.places.iter().enumerate() {
            if let Some(parent) = p.parent {
                if parent >= desc.places.len() || parent == i {
                    return Err(TopologyError::BadParent { place: i, parent });
                }
            }
        }

        let mut children: Vec<Vec<PlaceId>> = vec![Vec::new(); desc.places.len()];
        for (i, p) in desc.places.iter().enumerate() {
            if let Some(parent) = p.parent {
                children[parent].push(PlaceId(i));
            }
        }

        // Every place must hang off the root; anything else means the
        // parent links form a cycle among non-root places.
        let mut reachable = vec![false; desc.places.len()];
        let mut stack = vec![root];
        while let Some(PlaceId(i)) = stack.pop() {
            if std::mem::replace(&mut reachable[i], true) {
                continue;
            }
            stack.extend(children[i].iter().copied());
        }
        if let Some(i) = reachable.iter().position(|r| !r) {
            return Err(TopologyError::Unreachable(i));
        }

        // Seat workers in declaration order.
        let mut homes = Vec::new();
        for (i, p) in desc.places.iter().enumerate() {
            for _ in 0..p.workers {
                homes.push(PlaceId(i));
            }
        }
        if homes.is_empty() {
            return Err(TopologyError::NoWorkers);
        }

        let nworkers = homes.len();
        let places = desc
            .places
            .iter()
            .enumerate()
            .map(|(i, p)| Place {
                parent: p.parent.map(PlaceId),
                children: std::mem::take(&mut children[i]),
                deques: (0..nworkers).map(|_| WorkDeque::new(deque_capacity)).collect(),
            })
            .collect();

        Ok(Self {
            places,
            root,
            homes,
        })
    }

    pub(crate) fn nworkers(&self) -> usize {
        self.homes.len()
    }

    pub(crate) fn nplaces(&self) -> usize {
        self.places.len()
    }

    pub(crate) fn root(&self) -> PlaceId {
        self.root
    }

    pub(crate) fn place(&self, id: PlaceId) -> &Place {
        &self.places[id.0]
    }

    pub(crate) fn contains(&self, id: PlaceId) -> bool {
        id.0 < self.places.len()
    }

    pub(crate) fn home_of(&self, worker: usize) -> PlaceId {
        self.homes[worker]
    }

    /// All queued-task deques are empty. Used by teardown assertions.
    pub(crate) fn all_deques_empty(&self) -> bool {
        self.places
            .iter()
            .all(|p| p.deques.iter().all(|d| d.is_empty()))
    }

    /// Place visiting order for steals from `home`. See the module docs.
    pub(crate) fn steal_order(&self, home: PlaceId) -> Vec<PlaceId> {
        let mut order = Vec::with_capacity(self.places.len());
        let mut visited = vec![false; self.places.len()];
        self.preorder(home, &mut visited, &mut order);

        let mut cursor = home;
        while let Some(parent) = self.places[cursor.0].parent {
            order.push(parent);
            visited[parent.0] = true;
            for &child in &self.places[parent.0].children {
                self.preorder(child, &mut visited, &mut order);
            }
            cursor = parent;
        }
        order
    }

    fn preorder(&self, at: PlaceId, visited: &mut [bool], out: &mut Vec<PlaceId>) {
        if std::mem::replace(&mut visited[at.0], true) {
            return;
        }
        out.push(at);
        for &child in &self.places[at.0].children {
            self.preorder(child, visited, out);
        }
    }

    /// The full victim list for `worker`: (place, victim deque) pairs in
    /// deterministic order, excluding the worker's own home deque.
    pub(crate) fn steal_path(&self, worker: usize) -> Vec<(PlaceId, usize)> {
        let home = self.home_of(worker);
        let n = self.nworkers();
        let mut path = Vec::new();
        for place in self.steal_order(home) {
            for offset in 1..=n {
                let victim = (worker + offset) % n;
                if place == home && victim == worker {
                    continue;
                }
                path.push((place, victim));
            }
        }
        path
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("places", &self.places.len())
            .field("workers", &self.homes.len())
            .field("root", &self.root())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SOCKETS: &str = r#"
        [[place]]
        workers = 0

        [[place]]
        parent = 0
        workers = 2

        [[place]]
        parent = 0
        workers = 2
    "#;

    #[test]
    fn parses_a_two_socket_descriptor() {
        let desc = TopologyDesc::parse(TWO_SOCKETS).unwrap();
        assert_eq!(desc.places.len(), 3);
        assert_eq!(desc.total_workers(), 4);
        assert_eq!(desc.places[1].parent, Some(0));
    }

    #[test]
    fn flat_descriptor_has_one_root() {
        let desc = TopologyDesc::flat(8);
        assert_eq!(desc.places.len(), 1);
        assert_eq!(desc.total_workers(), 8);
        let topo = Topology::build(&desc, 16).unwrap();
        assert_eq!(topo.nworkers(), 8);
        assert_eq!(topo.home_of(3), topo.root());
    }

    #[test]
    fn workers_are_seated_in_declaration_order() {
        let desc = TopologyDesc::parse(TWO_SOCKETS).unwrap();
        let topo = Topology::build(&desc, 16).unwrap();
        assert_eq!(topo.nworkers(), 4);
        assert_eq!(topo.home_of(0), PlaceId(1));
        assert_eq!(topo.home_of(1), PlaceId(1));
        assert_eq!(topo.home_of(2), PlaceId(2));
        assert_eq!(topo.home_of(3), PlaceId(2));
    }

    #[test]
    fn rejects_empty_descriptor() {
        let desc = TopologyDesc { places: vec![] };
        assert!(matches!(
            Topology::build(&desc, 16),
            Err(TopologyError::NoPlaces)
        ));
    }

    #[test]
    fn rejects_two_roots() {
        let desc = TopologyDesc {
            places: vec![
                PlaceDesc {
                    parent: None,
                    workers: 1,
                },
                PlaceDesc {
                    parent: None,
                    workers: 1,
                },
            ],
        };
        assert!(matches!(
            Topology::build(&desc, 16),
            Err(TopologyError::RootCount(2))
        ));
    }

    #[test]
    fn rejects_out_of_range_parent() {
        let desc = TopologyDesc {
            places: vec![
                PlaceDesc {
                    parent: None,
                    workers: 1,
                },
                PlaceDesc {
                    parent: Some(9),
                    workers: 0,
                },
            ],
        };
        assert!(matches!(
            Topology::build(&desc, 16),
            Err(TopologyError::BadParent { place: 1, parent: 9 })
        ));
    }

    #[test]
    fn rejects_parent_cycle() {
        // 0 is the root; 1 and 2 point at each other.
        let desc = TopologyDesc {
            places: vec![
                PlaceDesc {
                    parent: None,
                    workers: 1,
                },
                PlaceDesc {
                    parent: Some(2),
                    workers: 0,
                },
                PlaceDesc {
                    parent: Some(1),
                    workers: 0,
                },
            ],
        };
        assert!(matches!(
            Topology::build(&desc, 16),
            Err(TopologyError::Unreachable(_))
        ));
    }

    #[test]
    fn rejects_workerless_topology() {
        let desc = TopologyDesc {
            places: vec![PlaceDesc {
                parent: None,
                workers: 0,
            }],
        };
        assert!(matches!(
            Topology::build(&desc, 16),
            Err(TopologyError::NoWorkers)
        ));
    }

    #[test]
    fn steal_order_walks_subtree_then_ancestors() {
        let desc = TopologyDesc::parse(TWO_SOCKETS).unwrap();
        let topo = Topology::build(&desc, 16).unwrap();
        // Worker 0 lives at place 1: own place, then the root, then the
        // sibling socket under the root.
        assert_eq!(
            topo.steal_order(PlaceId(1)),
            vec![PlaceId(1), PlaceId(0), PlaceId(2)]
        );
        assert_eq!(
            topo.steal_order(PlaceId(2)),
            vec![PlaceId(2), PlaceId(0), PlaceId(1)]
        );
    }

    #[test]
    fn steal_path_is_deterministic_and_skips_own_home_deque() {
        let desc = TopologyDesc::parse(TWO_SOCKETS).unwrap();
        let topo = Topology::build(&desc, 16).unwrap();
        let path = topo.steal_path(0);
        assert_eq!(path, topo.steal_path(0));
        assert!(!path.contains(&(PlaceId(1), 0)));
        // Every other (place, deque) pair is present.
        assert_eq!(path.len(), 3 * 4 - 1);
        // Victim order within a place starts just after the thief.
        assert_eq!(path[0], (PlaceId(1), 1));
    }

    #[test]
    fn deeper_tree_steal_order_is_preorder_outward() {
        //        0
        //       / \
        //      1   4
        //     / \
        //    2   3
        let desc = TopologyDesc {
            places: vec![
                PlaceDesc {
                    parent: None,
                    workers: 0,
                },
                PlaceDesc {
                    parent: Some(0),
                    workers: 0,
                },
                PlaceDesc {
                    parent: Some(1),
                    workers: 1,
                },
                PlaceDesc {
                    parent: Some(1),
                    workers: 1,
                },
                PlaceDesc {
                    parent: Some(0),
                    workers: 1,
                },
            ],
        };
        let topo = Topology::build(&desc, 16).unwrap();
        // Worker 0 is seated at place 2.
        assert_eq!(
            topo.steal_order(PlaceId(2)),
            vec![PlaceId(2), PlaceId(1), PlaceId(3), PlaceId(0), PlaceId(4)]
        );
    }
}
