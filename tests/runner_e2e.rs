use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use homosilicus_harness::catalog::{OptionPair, Payoff, Persona, ScenarioCatalog, ScenarioDefinition};
use homosilicus_harness::gateway::ProviderError;
use homosilicus_harness::judge::{Choice, InferenceGateway, JudgeError, Judgment};
use homosilicus_harness::prompts::{PromptInstance, PROMPT_EN};
use homosilicus_harness::runner::{RunMode, Runner, RunnerConfig};
use homosilicus_harness::store::{PersonaKey, ResultStore, ScenarioEntry};
use homosilicus_harness::validate::{check_problems, missing_keys, ProblemPolicy};
use tempfile::tempdir;

/// Answers Right for "Inequality Aversion" and Left otherwise. Prompts that
/// contain any of `fail_on` come back as provider errors.
struct FakeGateway {
    calls: AtomicUsize,
    fail_on: Vec<&'static str>,
}

impl FakeGateway {
    fn new(fail_on: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_on,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceGateway for FakeGateway {
    async fn invoke(&self, prompt: &PromptInstance) -> Result<Judgment, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.iter().any(|m| prompt.user.contains(m)) {
            return Err(JudgeError::Provider(ProviderError::Timeout(
                Duration::from_secs(1),
                None,
            )));
        }
        let choice = if prompt.user.contains("Inequality Aversion") {
            Choice::Right
        } else {
            Choice::Left
        };
        Ok(Judgment {
            reasoning: "Splitting evenly feels right to me.".into(),
            choice,
        })
    }

    async fn batch(
        &self,
        prompts: &[PromptInstance],
    ) -> Result<Vec<Result<Judgment, JudgeError>>, JudgeError> {
        let mut out = Vec::with_capacity(prompts.len());
        for p in prompts {
            out.push(self.invoke(p).await);
        }
        if !out.is_empty() && out.iter().all(|r| r.is_err()) {
            return Err(JudgeError::BatchFailed {
                units: out.len(),
                last: "timeout".into(),
            });
        }
        Ok(out)
    }
}

fn scenarios() -> Arc<ScenarioCatalog> {
    Arc::new(
        ScenarioCatalog::new(vec![ScenarioDefinition {
            difficulty: "easy".into(),
            options: vec![
                OptionPair {
                    left: Payoff::new(0, 600),
                    right: Payoff::new(400, 400),
                },
                OptionPair {
                    left: Payoff::new(500, 500),
                    right: Payoff::new(200, 800),
                },
            ],
            metrics: vec!["Inequality Aversion".into(), "Fairness".into()],
        }])
        .unwrap(),
    )
}

fn runner(gateway: Arc<FakeGateway>, store: &ResultStore, config: RunnerConfig) -> Runner {
    Runner::new(gateway, scenarios(), PROMPT_EN, store.clone(), config)
}

fn personas(ids: &[u64]) -> Vec<Persona> {
    ids.iter()
        .map(|id| Persona::new(*id, format!("Persona number {id}")))
        .collect()
}

#[tokio::test]
async fn worked_example_then_rerun_is_a_no_op() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let gateway = FakeGateway::new(vec![]);

    let summary = runner(gateway.clone(), &store, RunnerConfig::default())
        .run(&personas(&[1]))
        .await
        .unwrap();
    assert_eq!(gateway.calls(), 2);
    assert_eq!(summary.attempted, vec![PersonaKey::Persona(1)]);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.slot_errors, 0);

    let doc = store.read(PersonaKey::Persona(1)).unwrap();
    let easy = doc.get("easy").unwrap();
    let s1 = easy.get("scenario_1").unwrap().as_record().unwrap();
    let s2 = easy.get("scenario_2").unwrap().as_record().unwrap();
    assert_eq!(s1.answer, "Right");
    assert_eq!(s1.metric, "Inequality Aversion");
    assert_eq!(s1.options.left.b.to_string(), "600");
    assert_eq!(s2.answer, "Left");
    assert_eq!(s2.persona_desc, "Persona number 1");

    // Second "run all": the gateway is not touched for persona 1.
    let summary = runner(gateway.clone(), &store, RunnerConfig::default())
        .run(&personas(&[1]))
        .await
        .unwrap();
    assert_eq!(gateway.calls(), 2);
    assert_eq!(summary.skipped, vec![PersonaKey::Persona(1)]);
    assert!(summary.attempted.is_empty());
}

#[tokio::test]
async fn only_new_personas_are_dispatched() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let gateway = FakeGateway::new(vec![]);

    runner(gateway.clone(), &store, RunnerConfig::default())
        .run(&personas(&[1, 2]))
        .await
        .unwrap();
    assert_eq!(gateway.calls(), 4);

    let summary = runner(gateway.clone(), &store, RunnerConfig::default())
        .run(&personas(&[1, 2, 3, 4]))
        .await
        .unwrap();
    assert_eq!(gateway.calls(), 8);
    assert_eq!(summary.skipped, [1, 2].map(PersonaKey::Persona).to_vec());
    assert_eq!(summary.attempted, [3, 4].map(PersonaKey::Persona).to_vec());
    assert_eq!(summary.completed, 2);
    assert!(missing_keys((1..=4).map(PersonaKey::Persona), &store)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn one_failing_unit_is_isolated_to_its_slot() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let gateway = FakeGateway::new(vec!["Persona number 2\n\n**Choices**\n- **Left** : Person B 500"]);

    let summary = runner(gateway.clone(), &store, RunnerConfig::default())
        .run(&personas(&[1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.slot_errors, 1);

    let doc = store.read(PersonaKey::Persona(2)).unwrap();
    let easy = doc.get("easy").unwrap();
    assert!(easy.get("scenario_1").unwrap().as_record().is_some());
    assert!(matches!(
        easy.get("scenario_2").unwrap(),
        ScenarioEntry::Failed(f) if f.error.contains("timeout")
    ));

    for other in [1, 3] {
        let doc = store.read(PersonaKey::Persona(other)).unwrap();
        assert!(doc
            .get("easy")
            .unwrap()
            .iter()
            .all(|(_, e)| e.as_record().is_some()));
    }

    let report = check_problems(&store, &ProblemPolicy::default(), None).unwrap();
    assert_eq!(report.flagged, vec![PersonaKey::Persona(2)]);
}

#[tokio::test]
async fn whole_batch_failure_writes_nothing_and_siblings_continue() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let gateway = FakeGateway::new(vec!["Persona number 2"]);

    let summary = runner(gateway.clone(), &store, RunnerConfig::default())
        .run(&personas(&[1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].persona, PersonaKey::Persona(2));
    assert!(!store.contains(PersonaKey::Persona(2)));
    assert_eq!(
        missing_keys((1..=3).map(PersonaKey::Persona), &store).unwrap(),
        vec![PersonaKey::Persona(2)]
    );
}

#[tokio::test]
async fn serial_mode_persists_even_when_every_unit_fails() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let gateway = FakeGateway::new(vec!["Persona number 5"]);
    let config = RunnerConfig {
        mode: RunMode::Serial,
        ..RunnerConfig::default()
    };

    let summary = runner(gateway.clone(), &store, config)
        .run(&personas(&[5]))
        .await
        .unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.slot_errors, 2);
    let report = check_problems(&store, &ProblemPolicy::default(), None).unwrap();
    assert_eq!(report.flagged, vec![PersonaKey::Persona(5)]);
}

#[tokio::test]
async fn problem_rerun_overwrites_flagged_documents() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();

    let flaky = FakeGateway::new(vec!["Persona number 2\n\n**Choices**\n- **Left** : Person B 500"]);
    runner(flaky, &store, RunnerConfig::default())
        .run(&personas(&[1, 2]))
        .await
        .unwrap();
    let report = check_problems(&store, &ProblemPolicy::default(), None).unwrap();
    assert_eq!(report.flagged, vec![PersonaKey::Persona(2)]);

    let healthy = FakeGateway::new(vec![]);
    let config = RunnerConfig {
        skip_existing: false,
        mode: RunMode::Serial,
        ..RunnerConfig::default()
    };
    let summary = runner(healthy.clone(), &store, config)
        .run(&personas(&[2]))
        .await
        .unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(healthy.calls(), 2);
    assert!(check_problems(&store, &ProblemPolicy::default(), None)
        .unwrap()
        .is_clean());
}

#[tokio::test]
async fn baseline_repeats_use_nopersona_keys() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let gateway = FakeGateway::new(vec![]);

    let summary = runner(gateway.clone(), &store, RunnerConfig::default())
        .run_baseline(3)
        .await
        .unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(gateway.calls(), 6);
    assert!(dir.path().join("Person_NOPERSONA_0003.json").is_file());

    let doc = store.read(PersonaKey::Baseline(2)).unwrap();
    let rec = doc
        .get("easy")
        .unwrap()
        .get("scenario_1")
        .unwrap()
        .as_record()
        .unwrap();
    assert_eq!(rec.persona_id, Some(PersonaKey::Baseline(2)));
    assert_eq!(rec.persona_desc, "");
}

#[tokio::test]
async fn summary_file_round_trips() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let gateway = FakeGateway::new(vec![]);

    let summary = runner(gateway, &store, RunnerConfig::default())
        .run(&personas(&[1]))
        .await
        .unwrap();
    let path = summary.write_to(store.dir()).unwrap();
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(raw["completed"], 1);
    assert_eq!(raw["scenario_digest"], scenarios().digest());
    // The summary file is not mistaken for a persona document.
    assert_eq!(store.keys().unwrap().len(), 1);
}
