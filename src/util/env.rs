//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Get required env var; error if missing.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    init_env();
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        Err(_) => default,
    }
}

/// Postgres DSN for the pipeline.
pub fn db_url() -> anyhow::Result<String> {
    env_req("DATABASE_URL")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("SI_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("SI_TEST_PARSE", 7i64), 7);
        std::env::set_var("SI_TEST_PARSE", "42");
        assert_eq!(env_parse("SI_TEST_PARSE", 7i64), 42);
        std::env::remove_var("SI_TEST_PARSE");
    }

    #[test]
    fn env_flag_accepts_common_truthy_tokens() {
        std::env::set_var("SI_TEST_FLAG", "on");
        assert!(env_flag("SI_TEST_FLAG", false));
        std::env::set_var("SI_TEST_FLAG", "nope");
        assert!(!env_flag("SI_TEST_FLAG", true));
        std::env::remove_var("SI_TEST_FLAG");
    }
}
