pub const SNAPSHOT_KEY: &str = "roster:snapshot";
pub const LOCK_KEY: &str = "roster:lock";

pub fn fencing_token_key(lock_key: &str) -> String {
    format!("{}:token", lock_key)
}

pub fn durable_snapshot_name() -> &'static str {
    "roster.json"
}
