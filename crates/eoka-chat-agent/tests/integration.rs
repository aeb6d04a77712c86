//! Integration tests for eoka-chat-agent
//!
//! These tests require Chrome to be installed and available.
//! Run with: cargo test --test integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use eoka::Browser;
use eoka_chat_agent::{
    AgentConfig, CompletionConfig, DispatchEnvelope, EokaDriver, Locator, LocatorStrategy,
    PageAgent, SettleConfig,
};
use tokio_util::sync::CancellationToken;

/// A minimal chat page: the reply streams in word by word after send.
const CHAT_FIXTURE: &str = r##"data:text/html,
<main>
  <div id="log"></div>
  <form onsubmit="return false">
    <textarea placeholder="Message the assistant" rows="3" cols="60"></textarea>
    <button type="button" aria-label="Send message" onclick="send()">Send</button>
  </form>
</main>
<script>
let turn = 0;
function send() {
  const box = document.querySelector('textarea');
  const prompt = box.value;
  if (!prompt) return;
  box.value = '';
  turn++;
  const reply = document.createElement('div');
  reply.setAttribute('data-message-author-role', 'assistant');
  reply.id = 'model-response-' + turn;
  document.getElementById('log').appendChild(reply);
  const words = ('You said ' + prompt + ' on turn ' + turn + '. ').repeat(3).split(' ');
  let i = 0;
  const timer = setInterval(() => {
    if (i >= words.length) { clearInterval(timer); return; }
    i++;
    reply.innerHTML = '<p>' + words.slice(0, i).join(' ') + '</p><button>Copy</button>';
  }, 80);
}
</script>
"##;

/// Check if Chrome is available
fn chrome_available() -> bool {
    eoka::stealth::patcher::find_chrome().is_ok()
}

fn fast_config() -> AgentConfig {
    AgentConfig {
        settle: SettleConfig {
            max_checks: 3,
            check_interval_ms: 100,
            delay_ms: 200,
        },
        completion: CompletionConfig {
            poll_ms: 300,
            min_wait_ms: 1000,
            ..CompletionConfig::default()
        },
        ..AgentConfig::default()
    }
}

fn envelope(text: &str, index: usize) -> DispatchEnvelope {
    DispatchEnvelope {
        prompt_text: text.into(),
        index,
        per_attempt_timeout_ms: 30_000,
        automation_id: 1,
    }
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_locator_finds_fixture_controls() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let browser = Browser::launch().await.expect("Failed to launch browser");
    let page = browser
        .new_page(CHAT_FIXTURE)
        .await
        .expect("Failed to create page");
    let driver = EokaDriver::new(Arc::new(page));
    let strategy = LocatorStrategy::default();
    let locator = Locator::new(&driver, &strategy);

    let input = locator
        .find_input()
        .await
        .expect("query failed")
        .expect("no input");
    assert_eq!(input.tag, "textarea");
    assert!(input.editable);

    let submit = locator
        .find_submit()
        .await
        .expect("query failed")
        .expect("no submit");
    assert_eq!(submit.tag, "button");
    assert_eq!(submit.attr("aria-label"), Some("Send message"));

    assert!(locator.response_snapshot().await.expect("query failed").is_empty());

    drop(driver);
    browser.close().await.expect("Failed to close browser");
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_execute_streams_two_turns() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let browser = Browser::launch().await.expect("Failed to launch browser");
    let page = browser
        .new_page(CHAT_FIXTURE)
        .await
        .expect("Failed to create page");
    let driver = EokaDriver::new(Arc::new(page)).with_change_feed(Duration::from_millis(200));
    let agent = PageAgent::new(driver, fast_config());
    let cancel = CancellationToken::new();

    let first = agent
        .execute(&envelope("hello", 0), &cancel)
        .await
        .expect("no outcome");
    assert!(first.success, "{:?}", first.error_message);
    let text = first.response_text.unwrap();
    assert!(text.contains("You said hello on turn 1"), "got: {}", text);
    assert!(!text.contains("<button"), "chrome not stripped: {}", text);

    let second = agent
        .execute(&envelope("again", 1), &cancel)
        .await
        .expect("no outcome");
    assert!(second.success, "{:?}", second.error_message);
    let text = second.response_text.unwrap();
    assert!(text.contains("You said again on turn 2"), "got: {}", text);
    assert!(!text.contains("turn 1"), "stale reply selected: {}", text);

    drop(agent);
    browser.close().await.expect("Failed to close browser");
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn test_missing_controls_fail_cleanly() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let browser = Browser::launch().await.expect("Failed to launch browser");
    let page = browser
        .new_page("data:text/html,<p>No chat here</p>")
        .await
        .expect("Failed to create page");
    let config = AgentConfig {
        locate_timeout_ms: 1000,
        ..fast_config()
    };
    let agent = PageAgent::new(EokaDriver::new(Arc::new(page)), config);

    let outcome = agent
        .execute(&envelope("hello", 0), &CancellationToken::new())
        .await
        .expect("no outcome");
    assert!(!outcome.success);
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("element not found: input")
    );

    drop(agent);
    browser.close().await.expect("Failed to close browser");
}
