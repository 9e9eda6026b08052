use homosilicus_harness::store::{
    OrderedMap, PersonaKey, PersonaResult, RecordOptions, ResultStore, ScenarioEntry,
    ScenarioRecord,
};
use homosilicus_harness::validate::{check_problems, missing_keys, IssueKind, ProblemPolicy};
use tempfile::tempdir;

fn good_doc(key: PersonaKey) -> PersonaResult {
    let mut doc = PersonaResult::new();
    doc.get_or_insert_with("easy", OrderedMap::new).insert(
        "scenario_1",
        ScenarioEntry::Answered(ScenarioRecord {
            persona_id: Some(key),
            persona_desc: "p".into(),
            difficulty: "easy".into(),
            metric: "Fairness".into(),
            options: RecordOptions::default(),
            thought: "An even split is fair.".into(),
            answer: "Right".into(),
        }),
    );
    doc
}

#[test]
fn missing_is_exactly_the_complement_of_present() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let known: Vec<PersonaKey> = (1..=10).map(PersonaKey::Persona).collect();

    // Present: even ids, one of them with garbage content.
    for key in known.iter().filter(|k| k.persona_idx().unwrap() % 2 == 0) {
        store.write(*key, &good_doc(*key)).unwrap();
    }
    std::fs::write(store.path_for(PersonaKey::Persona(4)), "{ not json").unwrap();
    // Documents for unknown personas do not matter.
    store
        .write(PersonaKey::Persona(99), &good_doc(PersonaKey::Persona(99)))
        .unwrap();

    let missing = missing_keys(known.iter().copied(), &store).unwrap();
    assert_eq!(
        missing,
        [1, 3, 5, 7, 9].map(PersonaKey::Persona).to_vec()
    );
}

#[test]
fn unreadable_documents_are_flagged() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    store
        .write(PersonaKey::Persona(1), &good_doc(PersonaKey::Persona(1)))
        .unwrap();
    std::fs::write(store.path_for(PersonaKey::Persona(2)), "{ not json").unwrap();
    std::fs::write(
        store.path_for(PersonaKey::Baseline(1)),
        r#"{"easy": {"scenario_1": "Left"}}"#,
    )
    .unwrap();

    let report = check_problems(&store, &ProblemPolicy::default(), None).unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(
        report.flagged,
        vec![PersonaKey::Persona(2), PersonaKey::Baseline(1)]
    );
    assert!(report
        .issues
        .iter()
        .all(|i| i.kind == IssueKind::Unreadable && i.slot.is_none()));
}

#[test]
fn empty_answer_is_flagged_and_complete_answers_are_not() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();

    let mut bad = good_doc(PersonaKey::Persona(1));
    bad.get_or_insert_with("easy", OrderedMap::new).insert(
        "scenario_2",
        ScenarioEntry::Answered(ScenarioRecord {
            persona_id: Some(PersonaKey::Persona(1)),
            persona_desc: "p".into(),
            difficulty: "easy".into(),
            metric: "Fairness".into(),
            options: RecordOptions::default(),
            thought: "I could not decide at all.".into(),
            answer: String::new(),
        }),
    );
    store.write(PersonaKey::Persona(1), &bad).unwrap();
    store
        .write(PersonaKey::Persona(2), &good_doc(PersonaKey::Persona(2)))
        .unwrap();

    let report = check_problems(&store, &ProblemPolicy::default(), None).unwrap();
    assert_eq!(report.flagged, vec![PersonaKey::Persona(1)]);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].slot.as_deref(), Some("easy/scenario_2"));
}
