use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::info;
use renewal_rs::amount;
use renewal_rs::browser::{BrowserRuntime, LaunchPlan, SessionCookie};
use renewal_rs::config::RunConfig;
use renewal_rs::restriction::{self, RestrictionStatus};
use renewal_rs::runtime::ChromiumoxideRuntime;

const INVOICE_PAGE: &str = "data:text/html,<html><head><title>Invoice</title></head><body>\
    <div class='totals'><div>Subtotal: $0.00</div><div>Total: $0.00</div></div>\
    <button id='pay'>Pay</button><button id='hidden' style='display:none'>Hidden</button>\
    </body></html>";

#[tokio::test]
async fn chromiumoxide_drives_a_local_page() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let chrome_bin = match env::var("RENEWAL_CHROME_BIN") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => {
            eprintln!("skipping chromiumoxide integration test: RENEWAL_CHROME_BIN not set");
            return Ok(());
        }
    };

    if !chrome_bin.exists() {
        eprintln!(
            "skipping chromiumoxide integration test: chrome executable not found at {}",
            chrome_bin.display()
        );
        return Ok(());
    }

    let mut config = RunConfig::default();
    config.headless = true;
    config.chrome_executable = Some(chrome_bin);

    let runtime = ChromiumoxideRuntime::new();
    runtime
        .launch(&LaunchPlan::from_config(&config))
        .await
        .context("failed to launch chrome")?;

    runtime
        .navigate(INVOICE_PAGE, Duration::from_secs(15))
        .await
        .context("failed to load the invoice page")?;

    let pay = runtime
        .find_element("#pay")
        .await?
        .ok_or_else(|| anyhow!("pay button not visible"))?;
    assert_eq!(runtime.read_text(Some(&pay)).await?.trim(), "Pay");
    assert!(
        runtime.find_element("#hidden").await?.is_none(),
        "hidden elements must not be reported as visible"
    );

    let invoice = amount::extract(&runtime, Duration::from_secs(5)).await?;
    info!("Invoice amount read from chrome: {invoice}");
    assert!(invoice.is_zero());
    assert_eq!(
        restriction::check(&runtime, Duration::from_secs(5)).await?,
        RestrictionStatus::NotRestricted
    );

    let title = runtime.title().await?;
    assert_eq!(title.as_deref(), Some("Invoice"));

    let screenshot = runtime.screenshot(true).await?;
    assert!(screenshot.starts_with(&[0x89, b'P', b'N', b'G']));

    // Cookies cannot be scoped to data: URLs, so only check the call succeeds.
    runtime
        .set_cookies(&[SessionCookie::new("session", "abc").scoped(Some("example.com".into()), "/")])
        .await
        .context("chrome rejected the cookie set")?;

    runtime.shutdown().await.context("failed to close chrome")?;
    Ok(())
}
