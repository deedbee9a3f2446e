//! Breadth-first walks over the energized AC topology.

use crate::{BusId, Edge, Network, Node};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Buses synchronously connected to `start` through enabled AC branches.
///
/// HVDC links are not followed.
pub fn connected_buses(network: &Network, start: BusId) -> HashSet<BusId> {
    let mut members = HashSet::new();
    let Some(start_idx) = network.bus_node(start) else {
        return members;
    };
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([start_idx]);
    while let Some(node) = queue.pop_front() {
        if !visited.insert(node) {
            continue;
        }
        match &network.graph[node] {
            Node::Bus(bus) if !bus.disabled => {
                members.insert(bus.id);
            }
            _ => continue,
        }
        for edge in network.graph.edges(node) {
            let Edge::Branch(branch) = edge.weight() else {
                continue;
            };
            if branch.disabled {
                continue;
            }
            let next = if edge.source() == node { edge.target() } else { edge.source() };
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    members
}

/// Areas found first when walking from `start` without crossing any area boundary.
///
/// The walk stops expanding at buses that belong to an area, so a slack bus
/// outside every area is apportioned to its nearest neighbouring areas.
pub fn nearest_areas(network: &Network, start: BusId) -> BTreeSet<crate::AreaId> {
    let boundaries: HashSet<_> = network
        .areas
        .iter()
        .flat_map(|a| a.boundaries.iter().map(|b| b.branch))
        .collect();
    let mut found = BTreeSet::new();
    let Some(start_idx) = network.bus_node(start) else {
        return found;
    };

    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([start_idx]);
    while let Some(node) = queue.pop_front() {
        if !visited.insert(node) {
            continue;
        }
        if let Node::Bus(bus) = &network.graph[node] {
            if let Some(area) = bus.area {
                found.insert(area);
                continue;
            }
        }
        for edge in network.graph.edges(node) {
            let Edge::Branch(branch) = edge.weight() else {
                continue;
            };
            if branch.disabled || boundaries.contains(&branch.id) {
                continue;
            }
            let next = if edge.source() == node { edge.target() } else { edge.source() };
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::*;

    fn chain() -> Network {
        let mut network = Network::new();
        for (i, area) in [(1, Some(1)), (2, None), (3, Some(2)), (4, None)] {
            let mut bus = Bus::new(BusId::new(i), format!("B{i}"), 225.0);
            bus.area = area.map(AreaId::new);
            network.add_bus(bus).unwrap();
        }
        for (id, a, b) in [(1, 1, 2), (2, 2, 3)] {
            network
                .add_branch(Branch::new(
                    BranchId::new(id),
                    format!("L{id}"),
                    BusId::new(a),
                    BusId::new(b),
                    0.0,
                    0.1,
                ))
                .unwrap();
        }
        network
            .add_hvdc_line(HvdcLine::new(HvdcId::new(1), "H", BusId::new(3), BusId::new(4), 0.1))
            .unwrap();
        network
    }

    #[test]
    fn test_connected_buses_skip_hvdc_and_open_branches() {
        let mut network = chain();
        let island = connected_buses(&network, BusId::new(1));
        assert_eq!(island.len(), 3);
        assert!(!island.contains(&BusId::new(4)));

        network.branch_mut(BranchId::new(2)).unwrap().disabled = true;
        assert_eq!(connected_buses(&network, BusId::new(1)).len(), 2);
    }

    #[test]
    fn test_nearest_areas_from_unassigned_bus() {
        let network = chain();
        let areas = nearest_areas(&network, BusId::new(2));
        assert_eq!(areas.into_iter().collect::<Vec<_>>(), vec![AreaId::new(1), AreaId::new(2)]);
    }

    #[test]
    fn test_nearest_areas_stops_at_boundary() {
        let mut network = chain();
        network.areas.push(
            Area::new(AreaId::new(2), "A2", 0.0).with_boundary(BranchId::new(2), BranchSide::Two),
        );
        let areas = nearest_areas(&network, BusId::new(2));
        assert_eq!(areas.into_iter().collect::<Vec<_>>(), vec![AreaId::new(1)]);
    }
}
