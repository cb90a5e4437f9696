use experiment_local::{AnalyticsEvent, AssignmentConfig, Client, Config, User};

pub fn main() {
    env_logger::init();

    let deployment_key = std::env::var("EXPERIMENT_DEPLOYMENT_KEY").unwrap();
    let config = Config::new()
        .with_stream_updates(std::env::var("EXPERIMENT_STREAM").is_ok())
        .with_assignment_config(AssignmentConfig::new(|event: AnalyticsEvent| {
            println!("Tracked: {} for {:?}", event.event_type, event.user_id);
        }));
    let client = Client::new(deployment_key, config).unwrap();

    // Blocks until the first set of flag configs has been downloaded.
    client.start().unwrap();

    let mut user = User::from_user_id("test-user");
    user.user_properties
        .insert("plan".to_owned(), serde_json::json!("pro"));

    // Empty flag keys evaluates every flag.
    let variants = client.evaluate_v2::<&str>(&user, &[]).unwrap();
    for (flag_key, variant) in &variants {
        println!("{flag_key}: {} {:?}", variant.key, variant.value);
    }

    client.stop();
}
