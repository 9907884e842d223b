// tests/config_env.rs
//
// Settings loading: file discovery via PIPELINE_CONFIG_PATH plus env overrides.
// Env-mutating, hence serialized.

use std::{env, fs};

use serial_test::serial;
use stock_news_pipeline::scheduler::Schedule;
use stock_news_pipeline::Settings;

const VARS: &[&str] = &[
    "PIPELINE_CONFIG_PATH",
    "OLLAMA_HOST",
    "OLLAMA_MODEL",
    "MAX_CONCURRENT_FETCHES",
    "AUTO_DISABLE_THRESHOLD",
    "GLOBAL_PAUSE",
    "BROWSERLESS_URL",
    "BROWSERLESS_TOKEN",
    "DISCORD_WEBHOOK_URL",
    "SLACK_WEBHOOK_URL",
];

fn clear_env() {
    for v in VARS {
        env::remove_var(v);
    }
}

#[serial]
#[test]
fn file_then_env_overrides() {
    clear_env();
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("pipeline.toml");
    fs::write(
        &path,
        r#"
[scheduler]
max_concurrent = 4
failure_threshold = 2

[extraction]
model = "qwen2.5:7b"

[[sources]]
id = 10
name = "Wire"
url = "https://wire.example.com/rss"
source_type = "feed"
schedule = { cron = "0 * * * *" }
"#,
    )
    .unwrap();
    env::set_var("PIPELINE_CONFIG_PATH", path.display().to_string());
    env::set_var("AUTO_DISABLE_THRESHOLD", "9");
    env::set_var("DISCORD_WEBHOOK_URL", "https://discord.example.com/hook");

    let s = Settings::load().unwrap();
    assert_eq!(s.scheduler.max_concurrent, 4);
    assert_eq!(s.scheduler.failure_threshold, 9);
    assert_eq!(s.extraction.model, "qwen2.5:7b");
    assert_eq!(
        s.notify.discord_webhook_url.as_deref(),
        Some("https://discord.example.com/hook")
    );
    assert_eq!(s.sources.len(), 1);
    assert_eq!(s.sources[0].schedule, Schedule::Cron("0 * * * *".into()));
    clear_env();
}

#[serial]
#[test]
fn missing_explicit_path_is_an_error() {
    clear_env();
    env::set_var("PIPELINE_CONFIG_PATH", "/definitely/not/here.toml");
    assert!(Settings::load().is_err());
    clear_env();
}

#[serial]
#[test]
fn defaults_without_any_file() {
    clear_env();
    // Isolate CWD so the repo's config/ is not picked up.
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();

    env::set_var("MAX_CONCURRENT_FETCHES", "0");
    env::set_var("GLOBAL_PAUSE", "1");
    let s = Settings::load().unwrap();
    assert_eq!(s.scheduler.max_concurrent, 1);
    assert!(s.scheduler.start_paused);
    assert!(s.sources.is_empty());
    assert!(s.browserless.url.is_none());

    env::set_current_dir(&old).unwrap();
    clear_env();
}
