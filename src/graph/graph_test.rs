#[cfg(test)]
mod tests {
    use crate::config::{process_unit, ServiceDescriptor};
    use crate::graph::{GraphError, ServiceGraph};

    fn units(spec: &[(&str, &[&str])]) -> Vec<ServiceDescriptor> {
        spec.iter().map(|(n, d)| process_unit(n, d)).collect()
    }

    /// Layers respect dependencies and keep declaration order inside a layer.
    #[test]
    fn test_layers_follow_dependencies() {
        let graph = ServiceGraph::build(&units(&[
            ("ui-admin", &["api"]),
            ("db", &[]),
            ("api", &["db", "cache"]),
            ("cache", &[]),
            ("ui-public", &["api"]),
        ]))
        .unwrap();

        assert_eq!(
            graph.layers(),
            vec![
                vec!["db".to_string(), "cache".to_string()],
                vec!["api".to_string()],
                vec!["ui-admin".to_string(), "ui-public".to_string()],
            ]
        );
        assert_eq!(graph.shutdown_order()[0], vec!["ui-admin", "ui-public"]);
    }

    /// Dependents are direct only.
    #[test]
    fn test_dependents_are_direct() {
        let graph =
            ServiceGraph::build(&units(&[("db", &[]), ("api", &["db"]), ("ui", &["api"])])).unwrap();
        assert_eq!(graph.dependents("db"), vec!["api"]);
        assert_eq!(graph.dependents("api"), vec!["ui"]);
        assert!(graph.dependents("ui").is_empty());
        assert_eq!(graph.dependencies("ui"), vec!["api"]);
        assert!(graph.dependencies("missing").is_empty());
    }

    /// A cycle is rejected and named as a closed path.
    #[test]
    fn test_cycle_is_rejected_with_path() {
        let err = ServiceGraph::build(&units(&[
            ("a", &["b"]),
            ("b", &["c"]),
            ("c", &["a"]),
            ("d", &[]),
        ]))
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> c -> a");
    }

    /// A unit depending on itself is a one-node cycle.
    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = ServiceGraph::build(&units(&[("a", &["a"])])).unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle: a -> a");
    }

    #[test]
    fn test_unknown_dependency() {
        let err = ServiceGraph::build(&units(&[("api", &["db"])])).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                unit: "api".into(),
                dependency: "db".into()
            }
        );
    }

    #[test]
    fn test_duplicate_name() {
        let err = ServiceGraph::build(&units(&[("db", &[]), ("db", &[])])).unwrap_err();
        assert_eq!(err, GraphError::Duplicate("db".into()));
    }
}
