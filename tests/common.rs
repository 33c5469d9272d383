// tests/common.rs
use std::sync::Once;

static INIT: Once = Once::new();

// Loads .env for live tests and turns on test logging.
// Uses std::sync::Once to ensure it only runs once across all tests.
pub fn setup() {
    INIT.call_once(|| {
        if dotenv::from_path(".env").is_ok() {
            println!("Loaded .env file from current directory.");
        } else if dotenv::from_path("../.env").is_ok() {
            println!("Loaded .env file from parent directory.");
        } else {
            println!("Warning: .env file not found in current or parent directory.");
        }
        env_logger::builder().is_test(true).try_init().ok();
    });
}

#[allow(dead_code)]
pub fn get_env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{} environment variable not set", name))
}
