use anyhow::{Context, Result};
use std::sync::Arc;
use tabsync::api::YnabBudgetApi;
use tabsync::config::Config;
use tabsync::logging::init_logging;
use tabsync::storage::{FileArea, Store};
use tabsync::App;
use tabsync_auth::OAuthTokenClient;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("\nPlease create a tabsync.toml file with at least:");
            eprintln!("\n[oauth]");
            eprintln!("client_id = \"your-client-id\"");
            eprintln!("client_secret = \"your-client-secret\"");
            eprintln!("redirect_uri = \"https://your-extension/callback\"");
            std::process::exit(1);
        }
    };
    let (log_path, _log_guard) = init_logging()?;
    tracing::info!(log = %log_path.display(), "tabsync starting");

    let area = FileArea::open(config.store_dir()?).await?;
    let store = Store::new(Arc::new(area)).with_retry(config.retry_policy());
    let redirect_uri = config.oauth.redirect_uri.clone();
    let safety_margin = config.safety_margin();
    let endpoint = Arc::new(OAuthTokenClient::new(config.oauth)?);
    let api = Arc::new(YnabBudgetApi::new(config.api.base_url));

    let app = App::open(store, endpoint.clone(), api, safety_margin).await?;

    if !app.auth.is_logged_in() {
        login(&app, &endpoint, &redirect_uri).await?;
    }

    let budgets = app.cache.list_budgets().await?;
    println!("Budgets:");
    for budget in &budgets {
        println!("  {}  {}", budget.id, budget.name);
    }

    let Some(budget) = app.cache.selected_budget().await? else {
        println!("\nNo budgets found.");
        return Ok(());
    };
    let alerts = app.alerts(budget.id).await?;
    let snapshot = app.cache.snapshot(budget.id).await;

    println!("\n=== {} ===", budget.name);
    if snapshot.is_stale() {
        println!("(showing last-known data, a refresh failed)");
    }
    println!(
        "{} overspent categories, {} unapproved transactions",
        alerts.overspent_count(),
        alerts.unapproved_total
    );
    for (id, alert) in alerts.categories.iter().filter(|(_, a)| !a.is_empty()) {
        let Some(category) = snapshot.categories.get(id) else {
            continue;
        };
        let overspent = if alert.overspent { " overspent" } else { "" };
        println!(
            "  {:<30} {:>12}{} ({} unapproved)",
            category.name, category.balance, overspent, alert.unapproved
        );
    }
    for id in alerts.accounts_needing_reconciliation() {
        if let Some(account) = snapshot.accounts.get(&id) {
            println!("  {} needs reconciliation", account.name);
        }
    }

    Ok(())
}

async fn login(app: &App, endpoint: &OAuthTokenClient, redirect_uri: &str) -> Result<()> {
    let state = Uuid::new_v4().to_string();
    let auth_url = endpoint.authorize_url(&state)?;

    println!("\n=== YNAB Authentication Required ===\n");
    if let Err(e) = open::that(&auth_url) {
        eprintln!("Failed to open browser automatically: {}", e);
    }
    println!("Please open this URL in your browser if it did not open:");
    println!("{}\n", auth_url);
    println!("Paste the authorization code from the redirect URL:");

    let mut code = String::new();
    std::io::stdin()
        .read_line(&mut code)
        .context("Could not read authorization code")?;

    app.auth.acquire(code.trim(), redirect_uri).await?;
    println!("✓ Logged in");
    Ok(())
}
