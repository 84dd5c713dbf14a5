use std::collections::HashMap;

use eppo_evaluator::ContextAttributes;

pub fn main() -> eppo_evaluator::Result<()> {
    // Configure env_logger to see evaluator logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("eppo")).init();

    let api_key =
        std::env::var("EPPO_API_KEY").expect("EPPO_API_KEY env variable should contain API key");
    let mut client = eppo_evaluator::ClientConfig::from_api_key(api_key)
        .assignment_logger(|event| {
            println!("Logging assignment event: {:?}", event);
        })
        .bandit_logger(|event| {
            println!("Logging bandit event: {:?}", event);
        })
        .to_client();

    // Start a poller thread to fetch configuration from the server.
    let poller = client.start_poller_thread()?;

    // Block waiting for configuration. Until this call returns, the client will return defaults for
    // all assignments.
    if let Err(err) = poller.wait_for_configuration() {
        println!("error requesting configuration: {:?}", err);
    }

    // Get assignment for test-subject.
    let assignment = client
        .get_boolean_assignment("a-boolean-flag", "test-subject", &HashMap::new())
        .unwrap_or_default()
        // default assignment
        .unwrap_or(false);

    println!("Assignment: {:?}", assignment);

    let actions = HashMap::from([
        (
            "nike".to_owned(),
            [("brand_affinity".to_owned(), 0.4.into())]
                .into_iter()
                .collect::<ContextAttributes>(),
        ),
        ("adidas".to_owned(), ContextAttributes::default()),
    ]);
    let result = client.get_bandit_action(
        "a-bandit-flag",
        "test-subject",
        &ContextAttributes::default(),
        &actions,
        "control",
    )?;

    println!("Bandit variation: {}, action: {:?}", result.variation, result.action);

    poller.shutdown()
}
