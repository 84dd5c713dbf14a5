use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use eppo_evaluator::{
    bandits::BanditResponse, ufc::UniversalFlagConfig, AssignmentEvent, AssignmentValue,
    Attributes, BanditEvent, Client, ClientConfig, Configuration, ConfigurationStore,
    ContextAttributes, EvaluationMode, PollerThread, Result,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn load_configuration(flags: &str, bandits: Option<&str>) -> Result<Configuration> {
    let flags = UniversalFlagConfig::from_json(&std::fs::read(flags)?)?;
    let bandits = match bandits {
        Some(path) => Some(BanditResponse::from_json(&std::fs::read(path)?)?),
        None => None,
    };
    Ok(Configuration::from_server_response(flags, bandits))
}

#[test]
fn evaluates_flags_fetched_by_poller() {
    init_logger();

    let store = Arc::new(ConfigurationStore::new());
    let poller = PollerThread::start(
        |_: Option<&Configuration>| load_configuration("tests/data/ufc/flags-v1.json", None),
        store.clone(),
    )
    .unwrap();
    poller.wait_for_configuration().unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let client = {
        let events = events.clone();
        let config = ClientConfig::from_api_key("test-key")
            .evaluation_mode(EvaluationMode::Strict)
            .assignment_logger(move |event: AssignmentEvent| {
                events.lock().unwrap().push(event);
            });
        Client::new_with_configuration_store(config, store)
    };

    let alice: Attributes = [
        ("email".to_owned(), "alice@mycompany.com".into()),
        ("country".to_owned(), "US".into()),
    ]
    .into_iter()
    .collect();
    assert_eq!(
        client
            .get_boolean_assignment("kill-switch", "alice", &alice)
            .unwrap(),
        Some(true)
    );
    assert_eq!(
        client
            .get_string_assignment("new-user-onboarding", "alice", &alice)
            .unwrap(),
        Some("green".to_owned())
    );

    let bob: Attributes = [
        ("email".to_owned(), "bob@example.com".into()),
        ("country".to_owned(), "Canada".into()),
    ]
    .into_iter()
    .collect();
    assert_eq!(
        client.get_integer_assignment("integer-flag", "bob", &bob).unwrap(),
        Some(3)
    );

    let zach: Attributes = [
        ("country".to_owned(), "Mexico".into()),
        ("age".to_owned(), 15.0.into()),
    ]
    .into_iter()
    .collect();
    assert_eq!(
        client
            .get_string_assignment("new-user-onboarding", "zach", &zach)
            .unwrap(),
        Some("purple".to_owned())
    );

    assert_eq!(
        client
            .get_string_assignment("overridden-flag", "vip", &Attributes::new())
            .unwrap(),
        Some("gold".to_owned())
    );
    assert_eq!(
        client
            .get_variation(
                "disabled_flag",
                "alice",
                &alice,
                AssignmentValue::Integer(7)
            )
            .unwrap(),
        AssignmentValue::Integer(7)
    );

    // Repeating the same evaluation must not log a second event.
    client
        .get_boolean_assignment("kill-switch", "alice", &alice)
        .unwrap();

    let events = events.lock().unwrap();
    let logged = events
        .iter()
        .map(|event| (event.feature_flag.as_str(), event.subject.as_str()))
        .collect::<Vec<_>>();
    // zach hits an allocation with logging disabled and vip is an override.
    assert_eq!(
        logged,
        vec![
            ("kill-switch", "alice"),
            ("new-user-onboarding", "alice"),
            ("integer-flag", "bob"),
        ]
    );
    assert_eq!(events[0].experiment, "kill-switch-on-for-NA");

    poller.shutdown().unwrap();
}

#[test]
fn selects_bandit_action() {
    init_logger();

    let store = Arc::new(ConfigurationStore::new());
    store.set_configuration(Arc::new(
        load_configuration(
            "tests/data/ufc/bandit-flags-v1.json",
            Some("tests/data/ufc/bandit-models-v1.json"),
        )
        .unwrap(),
    ));

    let bandit_events = Arc::new(Mutex::new(Vec::new()));
    let client = {
        let bandit_events = bandit_events.clone();
        let config = ClientConfig::from_api_key("test-key").bandit_logger(
            move |event: BanditEvent| {
                bandit_events.lock().unwrap().push(event);
            },
        );
        Client::new_with_configuration_store(config, store)
    };

    let actions = HashMap::from([
        ("A".to_owned(), ContextAttributes::default()),
        ("B".to_owned(), ContextAttributes::default()),
    ]);

    for _ in 0..3 {
        let result = client
            .get_bandit_action(
                "banner_flag",
                "bob",
                &ContextAttributes::default(),
                &actions,
                "control",
            )
            .unwrap();
        assert_eq!(result.variation, "banner_bandit");
        assert_eq!(result.action.as_deref(), Some("B"));
    }

    // Graceful mode falls back to the default variation.
    let result = client
        .get_bandit_action(
            "unknown_flag",
            "bob",
            &ContextAttributes::default(),
            &actions,
            "control",
        )
        .unwrap();
    assert_eq!(result.variation, "control");
    assert_eq!(result.action, None);

    let bandit_events = bandit_events.lock().unwrap();
    assert_eq!(bandit_events.len(), 1);
    assert_eq!(bandit_events[0].action, "B");
    assert_eq!(bandit_events[0].model_version, "v1");
}
