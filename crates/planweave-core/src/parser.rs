//! Plan parser: dependency graph and deterministic topological ordering

use crate::error::{Error, Result};
use crate::plan::{Plan, PlanStep};
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use tracing::{debug, instrument};

/// A parsed plan: step lookup, dependency graph, execution order
#[derive(Debug, Clone)]
pub struct ParsedPlan {
    /// Step id to step
    pub step_map: BTreeMap<u32, PlanStep>,
    /// Step id to its predecessors
    pub dependency_graph: BTreeMap<u32, Vec<u32>>,
    /// Topological order; ties broken by ascending step id
    pub execution_order: Vec<u32>,
}

impl ParsedPlan {
    /// Steps that depend on the given step
    #[must_use]
    pub fn dependents(&self, step_id: u32) -> Vec<u32> {
        self.dependency_graph
            .iter()
            .filter(|(_, deps)| deps.contains(&step_id))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Validates plan structure and produces the execution order
pub struct PlanParser;

impl PlanParser {
    /// Parse a plan into its executable form
    ///
    /// Runs shape validation, dependency validation, cycle detection, and
    /// Kahn's algorithm. With the ascending-id tie-break the order is a
    /// stable linear extension of the dependency graph.
    #[instrument(skip(plan), fields(flow_id = %plan.flow_id, steps = plan.steps.len()))]
    pub fn parse(plan: &Plan) -> Result<ParsedPlan> {
        plan.validate()?;
        plan.validate_dependencies()?;

        let step_map: BTreeMap<u32, PlanStep> = plan
            .steps
            .iter()
            .map(|s| (s.step_id, s.clone()))
            .collect();
        let dependency_graph: BTreeMap<u32, Vec<u32>> = plan
            .steps
            .iter()
            .map(|s| (s.step_id, s.dependencies.clone()))
            .collect();

        Self::detect_cycles(&dependency_graph)?;
        let execution_order = Self::topological_order(&dependency_graph)?;
        debug!(?execution_order, "Plan parsed");

        Ok(ParsedPlan {
            step_map,
            dependency_graph,
            execution_order,
        })
    }

    /// DFS cycle detection with a recursion-stack set
    ///
    /// Reports the cycle path, e.g. `cycle: 1 -> 2 -> 1`.
    fn detect_cycles(graph: &BTreeMap<u32, Vec<u32>>) -> Result<()> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut on_stack: HashSet<u32> = HashSet::new();
        let mut path: Vec<u32> = Vec::new();

        fn visit(
            node: u32,
            graph: &BTreeMap<u32, Vec<u32>>,
            visited: &mut HashSet<u32>,
            on_stack: &mut HashSet<u32>,
            path: &mut Vec<u32>,
        ) -> Result<()> {
            visited.insert(node);
            on_stack.insert(node);
            path.push(node);

            for &next in graph.get(&node).map(Vec::as_slice).unwrap_or_default() {
                if !visited.contains(&next) {
                    visit(next, graph, visited, on_stack, path)?;
                } else if on_stack.contains(&next) {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(u32::to_string).collect();
                    cycle.push(next.to_string());
                    return Err(Error::Dependency(format!("cycle: {}", cycle.join(" -> "))));
                }
            }

            path.pop();
            on_stack.remove(&node);
            Ok(())
        }

        for &node in graph.keys() {
            if !visited.contains(&node) {
                visit(node, graph, &mut visited, &mut on_stack, &mut path)?;
            }
        }
        Ok(())
    }

    /// Kahn's algorithm with ascending-id tie-breaking
    fn topological_order(graph: &BTreeMap<u32, Vec<u32>>) -> Result<Vec<u32>> {
        let mut in_degree: BTreeMap<u32, usize> =
            graph.iter().map(|(&id, deps)| (id, deps.len())).collect();

        // Min-heap so equal-readiness steps come out in id order
        let mut ready: BinaryHeap<std::cmp::Reverse<u32>> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&id, _)| std::cmp::Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(graph.len());
        while let Some(std::cmp::Reverse(node)) = ready.pop() {
            order.push(node);
            for (&candidate, deps) in graph {
                if !deps.contains(&node) {
                    continue;
                }
                let degree = in_degree
                    .get_mut(&candidate)
                    .expect("every node has an in-degree entry");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(std::cmp::Reverse(candidate));
                }
            }
        }

        if order.len() != graph.len() {
            return Err(Error::Dependency(
                "dependency graph has a cycle, no execution order exists".into(),
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Complexity;
    use serde_json::Map;

    fn step(step_id: u32, deps: Vec<u32>) -> PlanStep {
        PlanStep {
            step_id,
            description: format!("step {step_id}"),
            tool: "tool".into(),
            tool_input: Map::new(),
            dependencies: deps,
            reasoning: None,
        }
    }

    fn plan(steps: Vec<PlanStep>) -> Plan {
        Plan {
            flow_id: "flow_test".into(),
            original_query: "q".into(),
            query_hash: None,
            created_at: String::new(),
            generation_time: 0.0,
            estimated_steps: None,
            overall_strategy: None,
            complexity_level: Some(Complexity::Simple),
            steps,
            reused_from: None,
            reflection_chain_id: None,
        }
    }

    #[test]
    fn test_linear_chain() {
        let parsed = PlanParser::parse(&plan(vec![
            step(1, vec![]),
            step(2, vec![1]),
            step(3, vec![2]),
        ]))
        .unwrap();
        assert_eq!(parsed.execution_order, vec![1, 2, 3]);
    }

    #[test]
    fn test_diamond_ties_break_ascending() {
        // 1 -> {2, 3} -> 4; 2 and 3 become ready together
        let parsed = PlanParser::parse(&plan(vec![
            step(1, vec![]),
            step(2, vec![1]),
            step(3, vec![1]),
            step(4, vec![2, 3]),
        ]))
        .unwrap();
        assert_eq!(parsed.execution_order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_independent_steps_come_out_in_id_order() {
        let parsed = PlanParser::parse(&plan(vec![
            step(1, vec![]),
            step(2, vec![]),
            step(3, vec![]),
        ]))
        .unwrap();
        assert_eq!(parsed.execution_order, vec![1, 2, 3]);
    }

    #[test]
    fn test_order_is_a_linear_extension() {
        let parsed = PlanParser::parse(&plan(vec![
            step(1, vec![]),
            step(2, vec![]),
            step(3, vec![1, 2]),
            step(4, vec![3]),
            step(5, vec![1]),
        ]))
        .unwrap();
        let position = |id: u32| {
            parsed
                .execution_order
                .iter()
                .position(|&n| n == id)
                .unwrap()
        };
        for (id, deps) in &parsed.dependency_graph {
            for dep in deps {
                assert!(position(*dep) < position(*id), "{dep} must precede {id}");
            }
        }
    }

    #[test]
    fn test_two_cycle_reports_path() {
        let error = PlanParser::parse(&plan(vec![step(1, vec![2]), step(2, vec![1])])).unwrap_err();
        match error {
            Error::Dependency(message) => {
                assert!(message.contains("cycle:"), "{message}");
                assert!(message.contains("1 -> 2 -> 1") || message.contains("2 -> 1 -> 2"));
            }
            other => panic!("expected DependencyError, got {other:?}"),
        }
    }

    #[test]
    fn test_three_cycle_detected() {
        let error =
            PlanParser::parse(&plan(vec![step(1, vec![3]), step(2, vec![1]), step(3, vec![2])]))
                .unwrap_err();
        assert!(matches!(error, Error::Dependency(_)));
    }

    #[test]
    fn test_dependents() {
        let parsed = PlanParser::parse(&plan(vec![
            step(1, vec![]),
            step(2, vec![1]),
            step(3, vec![1]),
        ]))
        .unwrap();
        assert_eq!(parsed.dependents(1), vec![2, 3]);
        assert!(parsed.dependents(3).is_empty());
    }

    #[test]
    fn test_stability_across_runs() {
        let build = || {
            PlanParser::parse(&plan(vec![
                step(1, vec![]),
                step(2, vec![]),
                step(3, vec![1]),
                step(4, vec![2]),
            ]))
            .unwrap()
            .execution_order
        };
        assert_eq!(build(), build());
    }
}
