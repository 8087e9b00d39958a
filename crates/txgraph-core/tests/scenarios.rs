use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Once;

use serde::Deserialize;
use txgraph_core::{
    ClusterTxGraph, FeePerWeight, Ref, RefId, TxGraph, TxGraphConfig, TxGraphError,
};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("txgraph_core=debug")),
            )
            .with_target(true)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Deserialize)]
struct ScenarioFixture {
    schema_version: u32,
    scenarios: Vec<Scenario>,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    name: String,
    #[serde(default)]
    config: TxGraphConfig,
    ops: Vec<Op>,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    #[default]
    Ok,
    Cycle,
    Limit,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    Add {
        name: String,
        fee: i64,
        size: i32,
    },
    Remove {
        name: String,
    },
    Depend {
        parent: String,
        child: String,
        #[serde(default)]
        expect: Outcome,
    },
    SetFee {
        name: String,
        fee: i64,
    },
    Compact,
    Reconcile,
    ExpectExists {
        name: String,
        exists: bool,
    },
    ExpectCount {
        count: usize,
    },
    ExpectFeerate {
        name: String,
        fee: i64,
        size: i32,
    },
    ExpectChunkFeerate {
        name: String,
        fee: i64,
        size: i32,
    },
    ExpectCluster {
        name: String,
        members: Vec<String>,
    },
    ExpectAncestors {
        name: String,
        members: Vec<String>,
    },
    ExpectDescendants {
        name: String,
        members: Vec<String>,
    },
    ExpectDistinctClusters {
        names: Vec<String>,
        count: usize,
    },
    ExpectMiningOrder {
        chunks: Vec<Vec<String>>,
    },
    ExpectWorstChunk {
        members: Vec<String>,
    },
}

fn load_fixture() -> ScenarioFixture {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/scenarios.json");
    let raw = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
    serde_json::from_str(&raw).expect("scenario fixture must be valid JSON")
}

fn lookup<'a>(refs: &'a HashMap<String, Ref>, name: &str) -> &'a Ref {
    refs.get(name).unwrap_or_else(|| panic!("transaction {name} was never added"))
}

/// Named transactions of one scenario.
struct Script {
    graph: ClusterTxGraph,
    refs: HashMap<String, Ref>,
    names: HashMap<RefId, String>,
}

impl Script {
    fn new(config: TxGraphConfig) -> Self {
        Self {
            graph: ClusterTxGraph::with_config(config).expect("fixture config must be valid"),
            refs: HashMap::new(),
            names: HashMap::new(),
        }
    }

    fn named(&self, ids: &[RefId]) -> Vec<String> {
        ids.iter()
            .map(|id| self.names.get(id).cloned().unwrap_or_else(|| format!("?{id}")))
            .collect()
    }

    fn sorted(mut names: Vec<String>) -> Vec<String> {
        names.sort();
        names
    }

    fn run(&mut self, scenario: &str, step: usize, op: &Op) {
        let at = format!("{scenario} step {step}");
        match op {
            Op::Add { name, fee, size } => {
                let r = self.graph.add_transaction(FeePerWeight::new(*fee, *size));
                let id = r.id().expect("fresh ref has an id");
                self.names.insert(id, name.clone());
                self.refs.insert(name.clone(), r);
            }
            Op::Remove { name } => {
                let r = lookup(&self.refs, name);
                self.graph.remove_transaction(r);
                assert!(r.is_empty(), "{at}: ref must be empty after removal");
            }
            Op::Depend {
                parent,
                child,
                expect,
            } => {
                let result = self
                    .graph
                    .add_dependency(lookup(&self.refs, parent), lookup(&self.refs, child));
                let outcome = match result {
                    Ok(()) => Outcome::Ok,
                    Err(TxGraphError::WouldCycle) => Outcome::Cycle,
                    Err(TxGraphError::ClusterLimitExceeded { .. }) => Outcome::Limit,
                    Err(e) => panic!("{at}: unexpected error {e}"),
                };
                assert_eq!(outcome, *expect, "{at}: {parent} -> {child}");
            }
            Op::SetFee { name, fee } => {
                self.graph.set_transaction_fee(lookup(&self.refs, name), *fee);
            }
            Op::Compact => self.graph.compact(),
            Op::Reconcile => self.graph.reconcile(),
            Op::ExpectExists { name, exists } => {
                let exists_now = self.graph.exists(lookup(&self.refs, name));
                assert_eq!(exists_now, *exists, "{at}: exists {name}");
            }
            Op::ExpectCount { count } => {
                assert_eq!(self.graph.get_transaction_count(), *count, "{at}: count");
            }
            Op::ExpectFeerate { name, fee, size } => {
                assert_eq!(
                    self.graph.get_individual_feerate(lookup(&self.refs, name)),
                    FeePerWeight::new(*fee, *size),
                    "{at}: feerate of {name}"
                );
            }
            Op::ExpectChunkFeerate { name, fee, size } => {
                let r = lookup(&self.refs, name);
                assert_eq!(
                    self.graph.get_chunk_feerate(r),
                    FeePerWeight::new(*fee, *size),
                    "{at}: chunk feerate of {name}"
                );
            }
            Op::ExpectCluster { name, members } => {
                let r = lookup(&self.refs, name);
                let got = self.graph.get_cluster(r);
                assert_eq!(&self.named(&got), members, "{at}: cluster of {name}");
            }
            Op::ExpectAncestors { name, members } => {
                let r = lookup(&self.refs, name);
                let got = self.graph.get_ancestors(r);
                assert_eq!(
                    Self::sorted(self.named(&got)),
                    Self::sorted(members.clone()),
                    "{at}: ancestors of {name}"
                );
            }
            Op::ExpectDescendants { name, members } => {
                let r = lookup(&self.refs, name);
                let got = self.graph.get_descendants(r);
                assert_eq!(
                    Self::sorted(self.named(&got)),
                    Self::sorted(members.clone()),
                    "{at}: descendants of {name}"
                );
            }
            Op::ExpectDistinctClusters { names, count } => {
                let args: Vec<&Ref> = names.iter().map(|n| lookup(&self.refs, n)).collect();
                assert_eq!(self.graph.count_distinct_clusters(&args), *count, "{at}: clusters");
            }
            Op::ExpectMiningOrder { chunks } => {
                let order = self.graph.get_chunks_in_mining_order();
                let got: Vec<Vec<String>> = order.iter().map(|c| self.named(&c.refs)).collect();
                assert_eq!(&got, chunks, "{at}: mining order");
            }
            Op::ExpectWorstChunk { members } => {
                let worst = self.graph.get_worst_chunk().expect("graph is not empty");
                assert_eq!(&self.named(&worst.refs), members, "{at}: worst chunk");
            }
        }
    }

    fn finish(mut self, scenario: &str) {
        self.graph
            .sanity_check()
            .unwrap_or_else(|e| panic!("{scenario}: sanity check failed: {e}"));
        for r in self.refs.values() {
            self.graph.remove_transaction(r);
        }
        assert_eq!(self.graph.get_transaction_count(), 0, "{scenario}: graph drained");
        self.graph
            .sanity_check()
            .unwrap_or_else(|e| panic!("{scenario}: sanity check after drain failed: {e}"));
    }
}

#[test]
fn replay_fixture_scenarios() {
    init_tracing();
    let fixture = load_fixture();
    assert_eq!(fixture.schema_version, 1, "unexpected fixture schema version");
    assert!(!fixture.scenarios.is_empty(), "fixture has no scenarios");

    for scenario in &fixture.scenarios {
        tracing::info!(scenario = %scenario.name, "replaying scenario");
        let mut script = Script::new(scenario.config.clone());
        for (step, op) in scenario.ops.iter().enumerate() {
            script.run(&scenario.name, step, op);
        }
        script.finish(&scenario.name);
    }
}

#[test]
fn invalid_config_is_rejected() {
    init_tracing();
    let config: TxGraphConfig =
        serde_json::from_str(r#"{ "max_cluster_count": 65 }"#).expect("parses");
    assert!(matches!(
        ClusterTxGraph::with_config(config),
        Err(TxGraphError::InvalidConfig(_))
    ));
}
