use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// One required lookup on a child object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupEdge {
    pub field: String,
    pub parent: String,
}

/// A lookup nulled during the insert pass and set by the deferred update
/// pass once its parent ids exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredLookup {
    pub object: String,
    pub field: String,
    pub parent: String,
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// Load order; every non-deferred edge has its parent before the child.
    pub order: Vec<String>,
    pub deferred: Vec<DeferredLookup>,
}

/// Build the restore schedule from the child -> parent lookup graph.
///
/// Acyclic edges are honored by a Kahn topological sort; among
/// simultaneously-ready objects the one with the fewest inbound edges loads
/// first, ties broken by name so plans are deterministic. Reference cycles
/// (self-lookups included) are resolved by the two-phase load: every lookup
/// on a cycle is deferred, members insert with those fields nulled, and the
/// update pass sets them afterwards.
pub fn plan(lookups: &HashMap<String, Vec<LookupEdge>>) -> RestorePlan {
    let objects: BTreeSet<String> = lookups.keys().cloned().collect();
    let mut deferred = Vec::new();

    // Dependency edges restricted to the selected set; self-lookups go
    // straight to the deferred pass.
    let mut edges: BTreeMap<String, Vec<LookupEdge>> = BTreeMap::new();
    for (child, child_lookups) in lookups {
        for edge in child_lookups {
            if !objects.contains(&edge.parent) {
                continue;
            }
            if edge.parent == *child {
                deferred.push(DeferredLookup {
                    object: child.clone(),
                    field: edge.field.clone(),
                    parent: edge.parent.clone(),
                });
                continue;
            }
            edges.entry(child.clone()).or_default().push(edge.clone());
        }
    }

    // Cycle members defer every intra-cycle lookup.
    let adjacency: BTreeMap<String, BTreeSet<String>> = objects
        .iter()
        .map(|object| {
            let parents = edges
                .get(object)
                .map(|list| list.iter().map(|e| e.parent.clone()).collect())
                .unwrap_or_default();
            (object.clone(), parents)
        })
        .collect();

    for component in strongly_connected_components(&adjacency) {
        if component.len() < 2 {
            continue;
        }
        let members: HashSet<&String> = component.iter().collect();
        debug!("Reference cycle detected: {:?}", component);

        for member in &component {
            if let Some(list) = edges.get_mut(member) {
                list.retain(|edge| {
                    if members.contains(&edge.parent) {
                        deferred.push(DeferredLookup {
                            object: member.clone(),
                            field: edge.field.clone(),
                            parent: edge.parent.clone(),
                        });
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }

    // Kahn over the residual DAG.
    let mut deps: BTreeMap<String, BTreeSet<String>> = objects
        .iter()
        .map(|object| {
            let parents: BTreeSet<String> = edges
                .get(object)
                .map(|list| list.iter().map(|e| e.parent.clone()).collect())
                .unwrap_or_default();
            (object.clone(), parents)
        })
        .collect();

    let mut inbound: BTreeMap<String, usize> = objects.iter().map(|o| (o.clone(), 0)).collect();
    for parents in deps.values() {
        for parent in parents {
            *inbound.entry(parent.clone()).or_default() += 1;
        }
    }

    let mut ready: BTreeSet<(usize, String)> = deps
        .iter()
        .filter(|(_, parents)| parents.is_empty())
        .map(|(object, _)| (inbound[object], object.clone()))
        .collect();
    deps.retain(|_, parents| !parents.is_empty());

    let mut order = Vec::with_capacity(objects.len());
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        let (_, object) = next;
        order.push(object.clone());

        let mut freed = Vec::new();
        for (child, parents) in deps.iter_mut() {
            if parents.remove(&object) && parents.is_empty() {
                freed.push(child.clone());
            }
        }
        for child in freed {
            deps.remove(&child);
            ready.insert((inbound[&child], child));
        }
    }

    debug_assert_eq!(order.len(), objects.len(), "cycle survived SCC deferral");
    deferred.sort_by(|a, b| (&a.object, &a.field).cmp(&(&b.object, &b.field)));

    RestorePlan { order, deferred }
}

/// Tarjan's algorithm over the lookup adjacency.
fn strongly_connected_components(
    adjacency: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<Vec<String>> {
    struct State<'a> {
        adjacency: &'a BTreeMap<String, BTreeSet<String>>,
        index: HashMap<String, usize>,
        lowlink: HashMap<String, usize>,
        on_stack: HashSet<String>,
        stack: Vec<String>,
        counter: usize,
        components: Vec<Vec<String>>,
    }

    fn connect(state: &mut State<'_>, node: &str) {
        state.index.insert(node.to_string(), state.counter);
        state.lowlink.insert(node.to_string(), state.counter);
        state.counter += 1;
        state.stack.push(node.to_string());
        state.on_stack.insert(node.to_string());

        let neighbors: Vec<String> = state
            .adjacency
            .get(node)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for neighbor in neighbors {
            if !state.index.contains_key(&neighbor) {
                connect(state, &neighbor);
                let low = state.lowlink[&neighbor].min(state.lowlink[node]);
                state.lowlink.insert(node.to_string(), low);
            } else if state.on_stack.contains(&neighbor) {
                let low = state.index[&neighbor].min(state.lowlink[node]);
                state.lowlink.insert(node.to_string(), low);
            }
        }

        if state.lowlink[node] == state.index[node] {
            let mut component = Vec::new();
            while let Some(member) = state.stack.pop() {
                state.on_stack.remove(&member);
                let done = member == node;
                component.push(member);
                if done {
                    break;
                }
            }
            component.sort();
            state.components.push(component);
        }
    }

    let mut state = State {
        adjacency,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        counter: 0,
        components: Vec::new(),
    };

    for node in adjacency.keys() {
        if !state.index.contains_key(node) {
            connect(&mut state, node);
        }
    }
    state.components
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn edge(field: &str, parent: &str) -> LookupEdge {
        LookupEdge {
            field: field.to_string(),
            parent: parent.to_string(),
        }
    }

    fn graph(entries: &[(&str, &[LookupEdge])]) -> HashMap<String, Vec<LookupEdge>> {
        entries
            .iter()
            .map(|(name, edges)| (name.to_string(), edges.to_vec()))
            .collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|o| o == name).unwrap()
    }

    #[test]
    fn test_parent_precedes_child() {
        let plan = plan(&graph(&[
            ("Account", &[]),
            ("Contact", &[edge("AccountId", "Account")]),
        ]));

        assert!(position(&plan.order, "Account") < position(&plan.order, "Contact"));
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn test_diamond_dependencies() {
        let plan = plan(&graph(&[
            ("A", &[]),
            ("B", &[edge("AId", "A")]),
            ("C", &[edge("AId", "A")]),
            ("D", &[edge("BId", "B"), edge("CId", "C")]),
        ]));

        assert_eq!(plan.order.len(), 4);
        assert!(position(&plan.order, "A") < position(&plan.order, "B"));
        assert!(position(&plan.order, "A") < position(&plan.order, "C"));
        assert!(position(&plan.order, "B") < position(&plan.order, "D"));
        assert!(position(&plan.order, "C") < position(&plan.order, "D"));
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let lookups = graph(&[
            ("A", &[]),
            ("B", &[edge("AId", "A")]),
            ("C", &[edge("AId", "A")]),
        ]);
        let first = plan(&lookups);
        let second = plan(&lookups);
        assert_eq!(first.order, second.order);
    }

    #[test]
    fn test_two_object_cycle_defers_both_lookups() {
        let plan = plan(&graph(&[
            ("A", &[edge("BRef", "B")]),
            ("B", &[edge("ARef", "A")]),
        ]));

        // Both objects insert (cyclic lookups nulled) and both references
        // are set by the deferred pass.
        assert_eq!(plan.order.len(), 2);
        assert_eq!(plan.deferred.len(), 2);
        assert!(plan
            .deferred
            .contains(&DeferredLookup {
                object: "A".to_string(),
                field: "BRef".to_string(),
                parent: "B".to_string(),
            }));
        assert!(plan
            .deferred
            .contains(&DeferredLookup {
                object: "B".to_string(),
                field: "ARef".to_string(),
                parent: "A".to_string(),
            }));
    }

    #[test]
    fn test_self_lookup_is_deferred() {
        let plan = plan(&graph(&[(
            "Account",
            &[edge("ParentAccountId", "Account")],
        )]));

        assert_eq!(plan.order, vec!["Account"]);
        assert_eq!(
            plan.deferred,
            vec![DeferredLookup {
                object: "Account".to_string(),
                field: "ParentAccountId".to_string(),
                parent: "Account".to_string(),
            }]
        );
    }

    #[test]
    fn test_cycle_with_downstream_child_keeps_its_edge() {
        let plan = plan(&graph(&[
            ("A", &[edge("BRef", "B")]),
            ("B", &[edge("ARef", "A")]),
            ("C", &[edge("ARef", "A")]),
        ]));

        // C is not on the cycle; it still loads after A.
        assert!(position(&plan.order, "A") < position(&plan.order, "C"));
        assert_eq!(plan.deferred.len(), 2, "only intra-cycle edges defer");
        assert!(plan.deferred.iter().all(|d| d.object != "C"));
    }

    #[test]
    fn test_lookups_outside_selection_are_ignored() {
        let plan = plan(&graph(&[(
            "Contact",
            &[edge("AccountId", "Account")],
        )]));

        // Account is not selected; the edge constrains nothing.
        assert_eq!(plan.order, vec!["Contact"]);
        assert!(plan.deferred.is_empty());
    }
}
