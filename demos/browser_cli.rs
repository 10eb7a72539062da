//! Thin manual smoke-test harness over the [`agentchrome`] façade: launch or
//! attach to Chrome, observe the page, and dispatch one action. Not the
//! library's contract — see `Browser` for that.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use agentchrome::config;
use agentchrome::{Browser, BrowserConfig, Endpoint};
use agentchrome::error::{AppError, ExitCode};
use agentchrome::serializer::SerializedPage;

#[derive(Parser)]
#[command(name = "agentchrome-demo", version, about = "Manual smoke test for the agentchrome façade")]
struct Cli {
    /// Attach to an existing Chrome instance at this WebSocket URL instead of launching one.
    #[arg(long, global = true)]
    ws_url: Option<String>,

    /// Path to a Chrome/Chromium executable (only used when launching).
    #[arg(long, global = true)]
    chrome_path: Option<PathBuf>,

    /// Launch headless (default when launching).
    #[arg(long, global = true)]
    headless: bool,

    /// Seconds to wait for Chrome to become ready when launching.
    #[arg(long, global = true, default_value_t = 20)]
    launch_timeout_secs: u64,

    /// Path to an `agentchrome` config file; defaults to the usual search order.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for the page to settle and print the rendered observation.
    Observe,
    /// Click the element at `index` from the last observation.
    Click { index: usize },
    /// Type `text` into the element at `index`, clearing it first.
    Type { index: usize, text: String },
    /// Select `value` on the `<select>` at `index`.
    Select { index: usize, value: String },
    /// Scroll the element at `index` (or the viewport, if omitted) toward `direction`.
    Scroll {
        #[arg(long)]
        index: Option<usize>,
        #[arg(long, default_value = "down")]
        direction: String,
        #[arg(long, default_value_t = 500.0)]
        amount: f64,
    },
    /// Dispatch a single key press.
    PressKey { key: String },
    /// Navigate to `url` and wait for it to settle.
    Navigate { url: String },
    /// Navigate back one history entry.
    Back,
    /// Navigate forward one history entry.
    Forward,
    /// Reload the current page.
    Refresh,
    /// Capture a screenshot, base64-encoded in the output.
    Screenshot {
        /// Capture beyond the viewport instead of just the visible area.
        #[arg(long)]
        full_page: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        e.print_json_stderr();
        #[allow(clippy::cast_possible_truncation)]
        std::process::exit(e.code as i32);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let (config_path, config_file) = config::load_config(cli.config.as_deref());
    let resolved = config::resolve_config(&config_file, config_path);

    let target = match cli.ws_url {
        Some(ws_url) => Endpoint::Attach { ws_url },
        None => Endpoint::Launch {
            headless: cli.headless,
            executable: cli.chrome_path,
            user_data_dir: None,
            extra_args: resolved.launch.extra_args.clone(),
        },
    };

    let browser_config = BrowserConfig {
        target,
        launch_timeout: Duration::from_secs(cli.launch_timeout_secs),
        load_sync: resolved.browser.to_load_sync_config(),
        max_lines: resolved.browser.max_lines,
        ..BrowserConfig::default()
    };

    let browser = Browser::start(browser_config).await?;
    let outcome = dispatch(&browser, cli.command).await;
    browser.close().await;
    outcome
}

async fn dispatch(browser: &Browser, command: Command) -> Result<(), AppError> {
    match command {
        Command::Observe => {
            let page = browser.observe().await?;
            print_observation(&page)
        }
        Command::Click { index } => {
            let page = browser.observe().await?;
            print_action(browser.click(&page.selector_map, index).await)
        }
        Command::Type { index, text } => {
            let page = browser.observe().await?;
            print_action(browser.type_text(&page.selector_map, index, &text).await)
        }
        Command::Select { index, value } => {
            let page = browser.observe().await?;
            print_action(browser.select(&page.selector_map, index, &value).await)
        }
        Command::Scroll { index, direction, amount } => {
            let page = browser.observe().await?;
            print_action(
                browser
                    .scroll(&page.selector_map, index, &direction, amount)
                    .await,
            )
        }
        Command::PressKey { key } => print_action(browser.press_key(&key).await),
        Command::Navigate { url } => print_action(browser.navigate(&url).await),
        Command::Back => print_action(browser.go_back().await),
        Command::Forward => print_action(browser.go_forward().await),
        Command::Refresh => print_action(browser.refresh().await),
        Command::Screenshot { full_page } => print_action(browser.screenshot(full_page).await),
    }
}

#[derive(Serialize)]
struct ObservationOutput<'a> {
    text: &'a str,
    element_count: usize,
}

fn print_observation(page: &SerializedPage) -> Result<(), AppError> {
    print_json(&ObservationOutput {
        text: &page.text,
        element_count: page.selector_map.len(),
    })
}

#[derive(Serialize)]
struct ActionOutput {
    ok: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

fn print_action(result: agentchrome::action::ActionResult) -> Result<(), AppError> {
    let ok = result.ok;
    print_json(&ActionOutput {
        ok: result.ok,
        message: result.message,
        data: result.data,
    })?;
    if ok {
        Ok(())
    } else {
        Err(AppError {
            message: "action did not succeed".to_string(),
            code: ExitCode::GeneralError,
            custom_json: None,
        })
    }
}

fn print_json(value: &impl Serialize) -> Result<(), AppError> {
    let json = serde_json::to_string(value).map_err(|e| AppError {
        message: format!("serialization error: {e}"),
        code: ExitCode::GeneralError,
        custom_json: None,
    })?;
    println!("{json}");
    Ok(())
}
