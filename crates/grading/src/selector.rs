//! Node selector resolution.

use labspec::{NodeSelector, Topology};

/// Resolve a selector to host names.
///
/// Group selectors return every node in the group, in topology declaration
/// order. The result never contains duplicates. Selectors are assumed valid;
/// an unknown group yields an empty list.
pub fn resolve_selector(topology: &Topology, selector: &NodeSelector) -> Vec<String> {
    match selector {
        NodeSelector::Host(host) => vec![host.clone()],
        NodeSelector::Group(group) => topology
            .nodes
            .iter()
            .filter(|n| n.in_group(group))
            .map(|n| n.name.clone())
            .collect(),
    }
}

/// Hosts of several groups, merged in topology order. `all` means every node.
pub fn hosts_in_groups<'a>(topology: &Topology, groups: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let groups: Vec<&str> = groups.into_iter().collect();
    topology
        .nodes
        .iter()
        .filter(|n| groups.iter().any(|g| *g == "all" || n.in_group(g)))
        .map(|n| n.name.clone())
        .collect()
}
