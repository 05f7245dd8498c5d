use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use smart_queue::audit::PgAuditSink;
use smart_queue::config;
use smart_queue::models::service::NewService;
use smart_queue::models::token::Token;
use smart_queue::notification::{self, sms, Notifier};
use smart_queue::scheduler::{EtaEstimator, QueueScheduler, ServeOutcome, TokenIssuer};
use smart_queue::store::postgres::PgStore;
use smart_queue::store::QueueStore;
use smart_queue::QueueError;

mod cli;

/// Everything a command handler needs, wired against Postgres.
pub struct AppState {
    pub db: Arc<PgStore>,
    pub issuer: TokenIssuer<PgStore>,
    pub scheduler: QueueScheduler<PgStore>,
    pub eta: EtaEstimator<PgStore>,
    pub notifier: Notifier,
    pub config: config::Config,
}

impl AppState {
    async fn connect(cfg: config::Config) -> anyhow::Result<Self> {
        let db = Arc::new(PgStore::connect(&cfg.database_url, cfg.db_max_connections).await?);
        let audit = Arc::new(PgAuditSink::new(db.pool().clone()));
        let provider = sms::provider_from_config(&cfg.sms)?;

        Ok(Self {
            issuer: TokenIssuer::new(db.clone()),
            scheduler: QueueScheduler::new(db.clone(), audit.clone()),
            eta: EtaEstimator::new(db.clone(), cfg.default_avg_service_time),
            notifier: Notifier::new(provider, db.clone(), db.clone(), audit),
            db,
            config: cfg,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "smart-queue"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "smart_queue=debug,smartq=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        cli::Commands::Migrate => {
            let db = PgStore::connect(&cfg.database_url, cfg.db_max_connections).await?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        cli::Commands::Service { command } => {
            let state = AppState::connect(cfg).await?;
            handle_service_command(command, &state).await
        }
        cli::Commands::Token { command } => {
            let state = AppState::connect(cfg).await?;
            handle_token_command(command, &state).await
        }
        cli::Commands::Queue { command } => {
            let state = AppState::connect(cfg).await?;
            handle_queue_command(command, &state).await
        }
    };

    if let Err(ref e) = result {
        if let Some(QueueError::Database(db)) = e.downcast_ref::<QueueError>() {
            tracing::error!("Database error: {}", db);
        }
        eprintln!("{}", render_error(e));
    }
    result
}

/// One-line error for the terminal, prefixed with the engine's error code.
fn render_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<QueueError>() {
        Some(qe) if qe.is_retryable() => format!("Error [{}]: {} (safe to retry)", qe.code(), qe),
        Some(qe) => format!("Error [{}]: {}", qe.code(), qe),
        None => format!("Error: {:?}", e),
    }
}

async fn handle_service_command(cmd: cli::ServiceCommands, state: &AppState) -> anyhow::Result<()> {
    match cmd {
        cli::ServiceCommands::Add {
            name,
            service_type,
            location,
            counters,
            avg_service_time,
        } => {
            if name.trim().is_empty() {
                anyhow::bail!("service name must not be empty");
            }
            let new = NewService {
                name,
                service_type,
                location: location.unwrap_or_default(),
                num_counters: counters.max(1),
                avg_service_time: avg_service_time.unwrap_or(state.config.default_avg_service_time),
            };
            let svc = state.db.create_service(new).await?;
            println!("Service created:");
            println!("  Name:      {}", svc.name);
            println!("  Avg time:  {} min", svc.avg_service_time);
            println!("  ID:        {}", svc.id);
        }
        cli::ServiceCommands::List => {
            let services = state.db.list_services().await?;
            if services.is_empty() {
                println!("No services found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<24} {:<8} {:<8} PAUSED",
                "ID", "NAME", "AVG", "LAST"
            );
            for s in services {
                println!(
                    "{:<38} {:<24} {:<8} {:<8} {}",
                    s.id, s.name, s.avg_service_time, s.last_token_number, s.paused
                );
            }
        }
        cli::ServiceCommands::Status { service_id, audit } => {
            let service_id = parse_id(&service_id, "service_id")?;
            let snap = state.scheduler.snapshot(service_id).await?;
            println!(
                "{} ({}): {} waiting, {} serving, {} completed, {} cancelled{}",
                snap.service.name,
                snap.service.id,
                snap.counts.waiting,
                snap.counts.serving,
                snap.counts.completed,
                snap.counts.cancelled,
                if snap.service.paused { " [PAUSED]" } else { "" }
            );
            print_tokens(&snap.tokens);

            if audit > 0 {
                let rows = state.db.list_audit_logs(service_id, audit).await?;
                println!();
                println!("{:<20} {:<12} {:<38} REASON", "WHEN", "ACTION", "ACTOR");
                for r in rows {
                    println!(
                        "{:<20} {:<12} {:<38} {}",
                        r.created_at.format("%Y-%m-%d %H:%M:%S"),
                        r.action,
                        r.actor_id,
                        r.reason.unwrap_or_default()
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_token_command(cmd: cli::TokenCommands, state: &AppState) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Issue {
            service_id,
            user_id,
            priority,
        } => {
            let service_id = parse_id(&service_id, "service_id")?;
            let user_id = parse_id(&user_id, "user_id")?;
            let token = state
                .issuer
                .issue_priority_token(user_id, service_id, priority)
                .await?;
            println!("Token issued:");
            println!("  Number:   #{}", token.token_number);
            println!("  Priority: {}", token.priority_level);
            println!("  ID:       {}", token.id);
        }
        cli::TokenCommands::Eta { token_id } => {
            let token_id = parse_id(&token_id, "token_id")?;
            let eta = state.eta.estimate_eta(token_id).await?;
            println!("Token #{} ({})", eta.token_number, eta.status);
            println!("  Ahead:   {}", eta.tokens_ahead);
            println!("  ETA:     {} min", eta.eta_minutes);
            match eta.current_serving {
                Some(n) => println!("  Serving: #{}", n),
                None => println!("  Serving: none"),
            }
        }
        cli::TokenCommands::Skip {
            token_id,
            admin_id,
            reason,
        } => {
            let token_id = parse_id(&token_id, "token_id")?;
            let admin_id = parse_id(&admin_id, "admin_id")?;
            if reason.trim().is_empty() {
                anyhow::bail!("a skip needs a reason; use `token cancel` instead");
            }
            let outcome = state
                .scheduler
                .skip_or_cancel(token_id, Some(admin_id), Some(&reason))
                .await?;
            println!("Token #{} skipped.", outcome.cancelled.token_number);
            print_promoted(outcome.next.as_ref());
        }
        cli::TokenCommands::Cancel {
            token_id,
            admin_id,
            user_id,
        } => {
            let token_id = parse_id(&token_id, "token_id")?;
            let outcome = match user_id {
                Some(user_id) => {
                    let user_id = parse_id(&user_id, "user_id")?;
                    state.scheduler.cancel_own_token(token_id, user_id).await?
                }
                None => {
                    let admin_id = parse_optional_id(admin_id.as_deref(), "admin_id")?;
                    state.scheduler.skip_or_cancel(token_id, admin_id, None).await?
                }
            };
            println!("Token #{} cancelled.", outcome.cancelled.token_number);
            print_promoted(outcome.next.as_ref());
        }
        cli::TokenCommands::Complete { token_id, admin_id } => {
            let token_id = parse_id(&token_id, "token_id")?;
            let admin_id = parse_optional_id(admin_id.as_deref(), "admin_id")?;
            let outcome = state.scheduler.complete_token(token_id, admin_id).await?;
            print_serve_outcome(&outcome);
        }
        cli::TokenCommands::Priority {
            token_id,
            level,
            admin_id,
        } => {
            let token_id = parse_id(&token_id, "token_id")?;
            let admin_id = parse_optional_id(admin_id.as_deref(), "admin_id")?;
            let token = state.scheduler.set_priority(token_id, level, admin_id).await?;
            println!("Token #{} priority set to {}.", token.token_number, token.priority_level);
        }
        cli::TokenCommands::Notify {
            token_id,
            admin_id,
            message,
            template,
        } => {
            let token_id = parse_id(&token_id, "token_id")?;
            let admin_id = parse_optional_id(admin_id.as_deref(), "admin_id")?;
            let token = state
                .db
                .get_token(token_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("token not found: {}", token_id))?;

            let text = match (message, template) {
                (Some(m), _) => m,
                (None, Some(key)) => notification::message_templates(token.token_number)
                    .into_iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, text)| text)
                    .ok_or_else(|| anyhow::anyhow!("unknown template: {} (next, serving, delayed)", key))?,
                (None, None) => anyhow::bail!("either --message or --template is required"),
            };

            let handle = state
                .notifier
                .send_token_notification(&token, text.trim(), admin_id)
                .await?;
            println!("SMS queued (log {}). Waiting for provider...", handle.log_id);
            let outcome = handle.delivered().await;
            if outcome.success {
                println!(
                    "Delivered. Provider id: {}",
                    outcome.provider_id.as_deref().unwrap_or("-")
                );
            } else {
                println!("Delivery failed: {}", outcome.details);
            }
        }
        cli::TokenCommands::Mine { user_id } => {
            let user_id = parse_id(&user_id, "user_id")?;
            let tokens = state.scheduler.tokens_for_user(user_id).await?;
            if tokens.is_empty() {
                println!("No tokens found.");
                return Ok(());
            }
            println!("{:<38} {:<38} {:<8} {:<10} JOINED", "ID", "SERVICE", "NUMBER", "STATUS");
            for t in tokens {
                println!(
                    "{:<38} {:<38} {:<8} {:<10} {}",
                    t.id,
                    t.service_id,
                    t.token_number,
                    t.status.as_str(),
                    t.joined_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }
    Ok(())
}

async fn handle_queue_command(cmd: cli::QueueCommands, state: &AppState) -> anyhow::Result<()> {
    match cmd {
        cli::QueueCommands::Next { service_id, admin_id } => {
            let service_id = parse_id(&service_id, "service_id")?;
            let admin_id = parse_id(&admin_id, "admin_id")?;
            let outcome = state.scheduler.call_next(service_id, admin_id).await?;
            print_serve_outcome(&outcome);
        }
        cli::QueueCommands::Serve { service_id } => {
            let service_id = parse_id(&service_id, "service_id")?;
            match state.scheduler.serve_next_without_completing(service_id).await? {
                Some(t) => println!("Now serving #{}.", t.token_number),
                None => println!("Nothing started (counter busy, queue empty, or paused)."),
            }
        }
        cli::QueueCommands::Pause { service_id, admin_id } => {
            let service_id = parse_id(&service_id, "service_id")?;
            let admin_id = parse_optional_id(admin_id.as_deref(), "admin_id")?;
            let svc = state.scheduler.pause(service_id, admin_id).await?;
            println!("Service {} paused.", svc.name);
        }
        cli::QueueCommands::Resume { service_id, admin_id } => {
            let service_id = parse_id(&service_id, "service_id")?;
            let admin_id = parse_optional_id(admin_id.as_deref(), "admin_id")?;
            let svc = state.scheduler.resume(service_id, admin_id).await?;
            println!("Service {} resumed.", svc.name);
        }
        cli::QueueCommands::Reorder {
            service_id,
            order,
            admin_id,
            reason,
        } => {
            let service_id = parse_id(&service_id, "service_id")?;
            let admin_id = parse_optional_id(admin_id.as_deref(), "admin_id")?;
            let mut ids = Vec::with_capacity(order.len());
            for raw in &order {
                ids.push(parse_id(raw, "token id")?);
            }
            state
                .scheduler
                .reorder_waiting(service_id, &ids, admin_id, reason.as_deref())
                .await?;
            println!("Reordered {} waiting tokens.", ids.len());
        }
    }
    Ok(())
}

fn print_tokens(tokens: &[Token]) {
    if tokens.is_empty() {
        println!("Queue is empty.");
        return;
    }
    println!("{:<8} {:<10} {:<9} {:<38} JOINED", "NUMBER", "STATUS", "PRIORITY", "ID");
    for t in tokens {
        println!(
            "{:<8} {:<10} {:<9} {:<38} {}",
            t.token_number,
            t.status.as_str(),
            t.priority_level,
            t.id,
            t.joined_at.format("%H:%M:%S")
        );
    }
}

fn print_serve_outcome(outcome: &ServeOutcome) {
    if let Some(done) = &outcome.completed {
        println!("Completed #{}.", done.token_number);
    }
    print_promoted(outcome.next.as_ref());
}

fn print_promoted(next: Option<&Token>) {
    match next {
        Some(t) => println!("Now serving #{}.", t.token_number),
        None => println!("No token called."),
    }
}

fn parse_id(raw: &str, what: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid {}: {}", what, raw))
}

fn parse_optional_id(raw: Option<&str>, what: &str) -> anyhow::Result<Option<Uuid>> {
    raw.map(|r| parse_id(r, what)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_carries_code() {
        let err = anyhow::Error::from(QueueError::TokenNotFound(Uuid::nil()));
        assert!(render_error(&err).starts_with("Error [token_not_found]:"));

        let err = anyhow::Error::from(QueueError::Fatal("deadlock detected".into()));
        assert!(render_error(&err).ends_with("(safe to retry)"));

        let err = anyhow::anyhow!("invalid token_id: abc");
        assert!(render_error(&err).starts_with("Error: "));
    }
}
