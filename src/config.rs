//! Defines the configuration settings for the feed-sweep collector.

use anyhow::Context;
use clap::Args;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Command line overrides shared by the subcommands. Every value is optional
/// so that unset flags leave file or default values alone.
#[derive(Args, Debug, Default, Clone)]
pub(crate) struct ConfigArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, env = "FEED_SWEEP_CONFIG")]
    pub config_file: Option<String>,

    /// Folder that receives batch files; must contain a `nodeN` path segment
    #[arg(short, long, env = "FEED_SWEEP_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Folder of prior batch files used to anchor the query window (defaults to the output folder)
    #[arg(long, env = "FEED_SWEEP_HISTORY_DIR")]
    pub history_dir: Option<PathBuf>,

    /// Records per batch file
    #[arg(long, env = "FEED_SWEEP_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Hard ceiling on novel records per run
    #[arg(long, env = "FEED_SWEEP_STOP_THRESHOLD")]
    pub stop_threshold: Option<u64>,

    /// Time budget in hours (fractions allowed)
    #[arg(long, env = "FEED_SWEEP_MAX_HOURS")]
    pub max_hours: Option<f64>,

    /// Repeat count above which a known key is treated as a stall
    #[arg(long, env = "FEED_SWEEP_REPEAT_THRESHOLD")]
    pub repeat_threshold: Option<u32>,

    /// Days subtracted from the anchor date to form the `since:` bound
    #[arg(long, env = "FEED_SWEEP_LAG_DAYS")]
    pub lag_days: Option<i64>,

    /// Minimum pause between scrolls (seconds)
    #[arg(long, env = "FEED_SWEEP_MIN_PAUSE")]
    pub min_pause: Option<f32>,

    /// Maximum pause between scrolls (seconds)
    #[arg(long, env = "FEED_SWEEP_MAX_PAUSE")]
    pub max_pause: Option<f32>,

    /// Comma-separated list of notification recipients
    #[arg(long, env = "FEED_SWEEP_NOTIFY_TO")]
    pub notify_to: Option<String>,

    /// SMTP relay host used for notifications
    #[arg(long, env = "FEED_SWEEP_SMTP_HOST")]
    pub smtp_host: Option<String>,

    /// SMTP password for the relay account
    #[arg(long, env = "FEED_SWEEP_SMTP_PASSWORD", hide_env_values = true)]
    pub smtp_password: Option<String>,

    /// DevTools endpoint of an already-running, logged-in browser
    #[arg(long, env = "FEED_SWEEP_DEVTOOLS_URL")]
    pub devtools_url: Option<Url>,

    /// Folder of saved feed pages to replay instead of a live browser
    #[arg(long, env = "FEED_SWEEP_SNAPSHOT_DIR")]
    pub snapshot_dir: Option<PathBuf>,
}

/// TOML Configuration file structure
#[derive(Deserialize, Debug, Default)]
struct ConfigFile {
    collection: Option<CollectionConfig>,
    timing: Option<TimingConfig>,
    query: Option<QueryConfig>,
    output: Option<OutputConfig>,
    notify: Option<NotifyConfig>,
    browser: Option<BrowserConfig>,
}

#[derive(Deserialize, Debug, Default)]
struct CollectionConfig {
    batch_size: Option<usize>,
    stop_threshold: Option<u64>,
    max_run_hours: Option<f64>,
    repeat_threshold: Option<u32>,
}

#[derive(Deserialize, Debug, Default)]
struct TimingConfig {
    min_pause: Option<f32>,
    max_pause: Option<f32>,
    settle_secs: Option<u64>,
    flush_pause_secs: Option<u64>,
    empty_feed_retries: Option<u32>,
    empty_feed_wait_secs: Option<u64>,
    retry_click_attempts: Option<u32>,
    retry_click_wait_secs: Option<u64>,
    search_step_wait_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
struct QueryConfig {
    lag_days: Option<i64>,
    shift_until_days: Option<i64>,
    shift_since_days: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
struct OutputConfig {
    output_dir: Option<PathBuf>,
    history_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct NotifyConfig {
    enabled: Option<bool>,
    recipients: Option<Vec<String>>,
    sender: Option<String>,
    smtp_host: Option<String>,
    smtp_port: Option<u16>,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct BrowserConfig {
    devtools_url: Option<Url>,
    feed_url: Option<Url>,
    snapshot_dir: Option<PathBuf>,
}

/// Waits used by the collection loop and its recovery paths.
#[derive(Debug, Clone)]
pub(crate) struct Timing {
    /// Minimum and maximum pause between scroll passes (seconds).
    pub pause_between_scrolls: (f32, f32),
    /// Wait after each scroll for new items to render.
    pub settle: Duration,
    /// Wait after each batch flush.
    pub flush_pause: Duration,
    /// Scroll-and-wait rounds before an empty feed counts as stalled.
    pub empty_feed_retries: u32,
    pub empty_feed_wait: Duration,
    /// Retry-affordance clicks before a repeated key counts as stalled.
    pub retry_click_attempts: u32,
    pub retry_click_wait: Duration,
    /// Wait between the steps of submitting a search query.
    pub search_step_wait: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            pause_between_scrolls: (30.0, 40.0),
            settle: Duration::from_secs(15),
            flush_pause: Duration::from_secs(20),
            empty_feed_retries: 5,
            empty_feed_wait: Duration::from_secs(10),
            retry_click_attempts: 20,
            retry_click_wait: Duration::from_secs(8),
            search_step_wait: Duration::from_secs(10),
        }
    }
}

impl Timing {
    /// All waits set to zero.
    #[cfg(test)]
    pub(crate) fn immediate() -> Self {
        Timing {
            pause_between_scrolls: (0.0, 0.0),
            settle: Duration::ZERO,
            flush_pause: Duration::ZERO,
            empty_feed_retries: 5,
            empty_feed_wait: Duration::ZERO,
            retry_click_attempts: 20,
            retry_click_wait: Duration::ZERO,
            search_step_wait: Duration::ZERO,
        }
    }

    /// Draws the randomized pause taken before each scroll.
    pub(crate) fn random_pause(&self) -> Duration {
        use rand::Rng;
        let (min, max) = self.pause_between_scrolls;
        if min >= max {
            return Duration::from_secs_f32(min.max(0.0));
        }
        let duration_secs = rand::thread_rng().gen_range(min..max);
        Duration::from_secs_f32(duration_secs)
    }
}

/// SMTP delivery settings for operational notifications.
#[derive(Debug, Clone)]
pub(crate) struct NotifySettings {
    pub enabled: bool,
    pub recipients: Vec<String>,
    pub sender: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
}

impl Default for NotifySettings {
    fn default() -> Self {
        NotifySettings {
            enabled: false,
            recipients: Vec::new(),
            sender: "feed-sweep@localhost".to_string(),
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
        }
    }
}

/// Application configuration settings.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Folder receiving batch files; its `nodeN` segment names the node.
    pub output_dir: PathBuf,
    /// Folder scanned for prior batches when building the query window.
    pub history_dir: Option<PathBuf>,
    /// Buffered records that trigger a normal flush.
    pub batch_size: usize,
    /// Novel records after which the run stops.
    pub stop_threshold: u64,
    /// Time budget in (fractional) hours.
    pub max_run_hours: f64,
    /// A known key re-observed more than this many times is a stall.
    pub repeat_threshold: u32,
    /// Days between the anchor date and the `since:` bound.
    pub lag_days: i64,
    /// Query shift: `until = stalled date - shift_until_days`.
    pub shift_until_days: i64,
    /// Query shift: `since = stalled date - shift_since_days`.
    pub shift_since_days: i64,
    pub timing: Timing,
    pub notify: NotifySettings,
    /// Page opened before the search query is submitted.
    pub feed_url: Url,
    pub devtools_url: Option<Url>,
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_dir: PathBuf::from("data/by_date/node1"),
            history_dir: None,
            batch_size: 500,
            stop_threshold: 500_000,
            max_run_hours: 3.0,
            repeat_threshold: 10,
            lag_days: 10,
            shift_until_days: 1,
            shift_since_days: 6,
            timing: Timing::default(),
            notify: NotifySettings::default(),
            feed_url: Url::parse("https://x.com/").expect("static feed URL is valid"),
            devtools_url: None,
            snapshot_dir: None,
        }
    }
}

impl Config {
    /// Folder holding prior batches; the output folder unless set.
    pub(crate) fn history_dir(&self) -> &Path {
        self.history_dir.as_deref().unwrap_or(&self.output_dir)
    }
}

/// Load configuration from a TOML file
fn load_config_file(file_path: &str) -> anyhow::Result<ConfigFile> {
    let path = Path::new(file_path);
    if !path.exists() {
        tracing::warn!("Configuration file {} not found, using defaults", file_path);
        return Ok(ConfigFile::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file: {}", file_path))?;

    let config = parse_config_file(&content)
        .with_context(|| format!("Failed to parse TOML configuration from {}", file_path))?;

    tracing::info!("Loaded configuration from {}", file_path);
    Ok(config)
}

fn parse_config_file(content: &str) -> Result<ConfigFile, toml::de::Error> {
    toml::from_str(content)
}

fn apply_file_config(config: &mut Config, file_config: &ConfigFile) {
    if let Some(collection) = &file_config.collection {
        if let Some(size) = collection.batch_size {
            config.batch_size = size;
        }
        if let Some(threshold) = collection.stop_threshold {
            config.stop_threshold = threshold;
        }
        if let Some(hours) = collection.max_run_hours {
            config.max_run_hours = hours;
        }
        if let Some(repeats) = collection.repeat_threshold {
            config.repeat_threshold = repeats;
        }
    }

    if let Some(timing) = &file_config.timing {
        if let Some(min_pause) = timing.min_pause {
            config.timing.pause_between_scrolls.0 = min_pause;
        }
        if let Some(max_pause) = timing.max_pause {
            config.timing.pause_between_scrolls.1 = max_pause;
        }
        if let Some(secs) = timing.settle_secs {
            config.timing.settle = Duration::from_secs(secs);
        }
        if let Some(secs) = timing.flush_pause_secs {
            config.timing.flush_pause = Duration::from_secs(secs);
        }
        if let Some(retries) = timing.empty_feed_retries {
            config.timing.empty_feed_retries = retries;
        }
        if let Some(secs) = timing.empty_feed_wait_secs {
            config.timing.empty_feed_wait = Duration::from_secs(secs);
        }
        if let Some(attempts) = timing.retry_click_attempts {
            config.timing.retry_click_attempts = attempts;
        }
        if let Some(secs) = timing.retry_click_wait_secs {
            config.timing.retry_click_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = timing.search_step_wait_secs {
            config.timing.search_step_wait = Duration::from_secs(secs);
        }
    }

    if let Some(query) = &file_config.query {
        if let Some(days) = query.lag_days {
            config.lag_days = days;
        }
        if let Some(days) = query.shift_until_days {
            config.shift_until_days = days;
        }
        if let Some(days) = query.shift_since_days {
            config.shift_since_days = days;
        }
    }

    if let Some(output) = &file_config.output {
        if let Some(dir) = &output.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(dir) = &output.history_dir {
            config.history_dir = Some(dir.clone());
        }
    }

    if let Some(notify) = &file_config.notify {
        if let Some(enabled) = notify.enabled {
            config.notify.enabled = enabled;
        }
        if let Some(recipients) = &notify.recipients {
            config.notify.recipients = recipients.clone();
        }
        if let Some(sender) = &notify.sender {
            config.notify.sender = sender.clone();
        }
        if let Some(host) = &notify.smtp_host {
            config.notify.smtp_host = host.clone();
        }
        if let Some(port) = notify.smtp_port {
            config.notify.smtp_port = port;
        }
        if let Some(username) = &notify.smtp_username {
            config.notify.smtp_username = Some(username.clone());
        }
        if let Some(password) = &notify.smtp_password {
            config.notify.smtp_password = Some(password.clone());
        }
    }

    if let Some(browser) = &file_config.browser {
        if let Some(url) = &browser.devtools_url {
            config.devtools_url = Some(url.clone());
        }
        if let Some(url) = &browser.feed_url {
            config.feed_url = url.clone();
        }
        if let Some(dir) = &browser.snapshot_dir {
            config.snapshot_dir = Some(dir.clone());
        }
    }
}

/// Apply command line arguments to the Config instance
fn apply_cli_args(config: &mut Config, args: &ConfigArgs) {
    if let Some(ref dir) = args.output_dir {
        config.output_dir = dir.clone();
    }

    if let Some(ref dir) = args.history_dir {
        config.history_dir = Some(dir.clone());
    }

    if let Some(size) = args.batch_size {
        config.batch_size = size;
    }

    if let Some(threshold) = args.stop_threshold {
        config.stop_threshold = threshold;
    }

    if let Some(hours) = args.max_hours {
        config.max_run_hours = hours;
    }

    if let Some(repeats) = args.repeat_threshold {
        config.repeat_threshold = repeats;
    }

    if let Some(days) = args.lag_days {
        config.lag_days = days;
    }

    if let Some(min_pause) = args.min_pause {
        config.timing.pause_between_scrolls.0 = min_pause;
    }

    if let Some(max_pause) = args.max_pause {
        config.timing.pause_between_scrolls.1 = max_pause;
    }

    if let Some(ref recipients) = args.notify_to {
        config.notify.recipients = recipients
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        config.notify.enabled = !config.notify.recipients.is_empty();
    }

    if let Some(ref host) = args.smtp_host {
        config.notify.smtp_host = host.clone();
    }

    if let Some(ref password) = args.smtp_password {
        config.notify.smtp_password = Some(password.clone());
    }

    if let Some(ref url) = args.devtools_url {
        config.devtools_url = Some(url.clone());
    }

    if let Some(ref dir) = args.snapshot_dir {
        config.snapshot_dir = Some(dir.clone());
    }
}

fn validate_config(config: &mut Config) -> anyhow::Result<()> {
    if !(config.max_run_hours > 0.0) {
        anyhow::bail!(
            "Maximum run time must be a positive number of hours, got {}",
            config.max_run_hours
        );
    }

    let (min, max) = config.timing.pause_between_scrolls;
    if min < 0.0 || max < 0.0 {
        config.timing.pause_between_scrolls = (min.max(0.0), max.max(0.0));
        tracing::warn!("Negative pause bounds were clamped to zero.");
    }

    if config.timing.pause_between_scrolls.0 > config.timing.pause_between_scrolls.1 {
        config.timing.pause_between_scrolls.1 = config.timing.pause_between_scrolls.0;
        tracing::warn!(
            "Min pause was greater than max pause. Setting both to {}",
            config.timing.pause_between_scrolls.0
        );
    }

    if config.batch_size == 0 {
        config.batch_size = 1;
        tracing::warn!("Batch size was set to 0. Setting to 1.");
    }

    if config.timing.empty_feed_retries == 0 {
        config.timing.empty_feed_retries = 1;
        tracing::warn!("Empty-feed retries was set to 0. Setting to 1.");
    }

    if config.timing.retry_click_attempts == 0 {
        config.timing.retry_click_attempts = 1;
        tracing::warn!("Retry click attempts was set to 0. Setting to 1.");
    }

    if config.lag_days < 0 {
        config.lag_days = 0;
        tracing::warn!("Lag days was negative. Setting to 0.");
    }

    if config.shift_since_days < config.shift_until_days {
        config.shift_since_days = config.shift_until_days;
        tracing::warn!(
            "Shift window 'since' offset was smaller than 'until' offset. Setting to {}",
            config.shift_until_days
        );
    }

    if config.notify.enabled && config.notify.recipients.is_empty() {
        config.notify.enabled = false;
        tracing::warn!("Notifications enabled without recipients. Disabling email delivery.");
    }

    Ok(())
}

pub(crate) fn build_config(args: &ConfigArgs) -> anyhow::Result<Config> {
    let mut config = Config::default();

    if let Some(ref file_path) = args.config_file {
        match load_config_file(file_path) {
            Ok(file_config) => apply_file_config(&mut config, &file_config),
            Err(e) => {
                tracing::error!("Failed to load configuration file: {}", e);
            }
        }
    } else {
        for path in ["./feed-sweep.toml", "./config.toml"].iter() {
            if Path::new(path).exists() {
                match load_config_file(path) {
                    Ok(file_config) => {
                        apply_file_config(&mut config, &file_config);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load configuration from {}: {}", path, e);
                    }
                }
            }
        }
    }

    apply_cli_args(&mut config, args);

    validate_config(&mut config)?;

    tracing::debug!("Final configuration: {:?}", config);

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ConfigArgs,
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.stop_threshold, 500_000);
        assert_eq!(config.repeat_threshold, 10);
        assert_eq!(config.timing.empty_feed_retries, 5);
        assert_eq!(config.timing.retry_click_attempts, 20);
        assert_eq!(config.history_dir(), Path::new("data/by_date/node1"));
    }

    #[test]
    fn test_file_config_overrides_defaults() {
        let file = parse_config_file(
            r#"
            [collection]
            batch_size = 50
            max_run_hours = 1.5

            [timing]
            min_pause = 1.0
            max_pause = 2.0
            retry_click_attempts = 3

            [notify]
            enabled = true
            recipients = ["ops@example.com"]
            smtp_port = 2525

            [browser]
            feed_url = "https://example.com/feed"
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        apply_file_config(&mut config, &file);

        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_run_hours, 1.5);
        assert_eq!(config.timing.pause_between_scrolls, (1.0, 2.0));
        assert_eq!(config.timing.retry_click_attempts, 3);
        assert!(config.notify.enabled);
        assert_eq!(config.notify.smtp_port, 2525);
        assert_eq!(config.feed_url.as_str(), "https://example.com/feed");
    }

    #[test]
    fn test_cli_args_take_precedence() {
        let cli = TestCli::parse_from([
            "test",
            "--output-dir",
            "out/node3",
            "--batch-size",
            "7",
            "--notify-to",
            "a@example.com, b@example.com,",
        ]);
        let mut config = Config::default();
        config.batch_size = 50;
        apply_cli_args(&mut config, &cli.args);

        assert_eq!(config.output_dir, PathBuf::from("out/node3"));
        assert_eq!(config.batch_size, 7);
        assert_eq!(
            config.notify.recipients,
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
        assert!(config.notify.enabled);
    }

    #[test]
    fn test_validate_clamps_inconsistent_values() {
        let mut config = Config::default();
        config.timing.pause_between_scrolls = (5.0, 2.0);
        config.batch_size = 0;
        config.shift_since_days = 0;
        config.notify.enabled = true;
        validate_config(&mut config).unwrap();

        assert_eq!(config.timing.pause_between_scrolls, (5.0, 5.0));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.shift_since_days, config.shift_until_days);
        assert!(!config.notify.enabled);
    }

    #[test]
    fn test_validate_rejects_non_positive_run_time() {
        let mut config = Config::default();
        config.max_run_hours = 0.0;
        assert!(validate_config(&mut config).is_err());
        config.max_run_hours = -1.0;
        assert!(validate_config(&mut config).is_err());
    }

    #[test]
    fn test_random_pause_within_bounds() {
        let mut timing = Timing::default();
        timing.pause_between_scrolls = (0.5, 1.0);
        for _ in 0..50 {
            let pause = timing.random_pause();
            assert!(pause >= Duration::from_secs_f32(0.5));
            assert!(pause <= Duration::from_secs_f32(1.0));
        }
        assert_eq!(Timing::immediate().random_pause(), Duration::ZERO);
    }
}
