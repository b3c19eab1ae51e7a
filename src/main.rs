use clap::Parser;
use colored::*;
use parley::config::{Cli, ClientConfig, Command, NegotiateArgs};
use parley::controller::NegotiationClient;
use parley::session::NegotiationSession;
use parley::transport::{HttpTransport, ReplayTransport, Transport};
use parley::types::{EventKind, NegotiationEvent, SessionStatus};

fn render_event(event: &NegotiationEvent) {
    let tag = format!("[{:>3}] {:<16}", event.seq, event.kind.name());
    let tag = match &event.kind {
        EventKind::OfferReceived { .. } => tag.green(),
        EventKind::OfferDeclined { .. } => tag.yellow(),
        EventKind::Completed { decision } if decision.success => tag.green().bold(),
        EventKind::Completed { .. } | EventKind::Errored { .. } => tag.red().bold(),
        EventKind::Cancelled => tag.magenta().bold(),
        EventKind::Unknown { .. } | EventKind::ParseError { .. } => tag.dimmed(),
        _ => tag.normal(),
    };
    println!("{} {}", tag, event.summary);
}

fn render_final(session: &NegotiationSession) {
    let status = session.status.to_string();
    let status = match session.status {
        SessionStatus::Completed => status.green().bold(),
        SessionStatus::Cancelled => status.magenta().bold(),
        _ => status.red().bold(),
    };
    println!();
    println!("Status: {}", status);
    if let Some(id) = &session.session_id {
        println!("Session: {}", id);
    }
    for offer in session.offers.values() {
        println!(
            "  offer {:<24} {:>5} x {:>12.2} = {:>14.2}",
            offer.party, offer.quantity, offer.price_per_unit, offer.total_cost
        );
    }
    if let Some(decision) = &session.decision {
        if decision.success {
            for selected in &decision.selected_offers {
                println!(
                    "  selected {:<21} {:>5} units, {:>14.2}",
                    selected.party, selected.quantity, selected.total_cost
                );
            }
            println!("Total cost: {:.2}", decision.total_cost);
        } else if let Some(reason) = &decision.reason {
            println!("Reason: {}", reason);
        }
        for recommendation in &decision.recommendations {
            println!("  - {}", recommendation);
        }
    }
    if let Some(error) = &session.error {
        println!("Error: {}", error);
    }
}

async fn follow<T: Transport>(
    transport: T,
    args: &NegotiateArgs,
) -> parley::types::Result<NegotiationSession> {
    let request = args.to_request()?;
    let client = NegotiationClient::new(transport);
    let mut handle = client.start(request);

    let cancel = handle.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let printer = if args.json {
        None
    } else {
        let mut printed = 0u64;
        handle.on_update(move |session| {
            for event in session.log.iter().filter(|e| e.seq > printed) {
                render_event(event);
            }
            printed = session.last_seq();
        })
    };

    let session = handle.finish().await?;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(session)
}

async fn negotiate(
    config: &ClientConfig,
    args: &NegotiateArgs,
) -> parley::types::Result<NegotiationSession> {
    match &args.replay {
        Some(path) => follow(ReplayTransport::from_file(path).await?, args).await,
        None => follow(HttpTransport::from_config(config)?, args).await,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _guard = match parley::logging::init_tracing(&cli.log_dir, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging in {}: {}", cli.log_dir.display(), e);
            std::process::exit(1);
        }
    };
    parley::logging::setup_panic_hook();

    let config = ClientConfig::from(&cli);

    match &cli.command {
        Command::Negotiate(args) => match negotiate(&config, args).await {
            Ok(session) => {
                if args.json {
                    match serde_json::to_string_pretty(&session) {
                        Ok(json) => println!("{}", json),
                        Err(e) => {
                            eprintln!("Failed to serialize session: {}", e);
                            std::process::exit(1);
                        }
                    }
                } else {
                    render_final(&session);
                }
                if session.status != SessionStatus::Completed {
                    std::process::exit(2);
                }
            }
            Err(e) => {
                tracing::error!("Negotiation failed: {}", e);
                eprintln!("Error: {}", e.inner);
                std::process::exit(1);
            }
        },
        Command::Status => {
            let status = match HttpTransport::from_config(&config) {
                Ok(transport) => transport.status().await,
                Err(e) => Err(e),
            };
            match status {
                Ok(status) => {
                    println!("Service: {}", status.status.bold());
                    if let Some(total) = status.total_agents {
                        println!("Agents: {}", total);
                    }
                    if let Some(active) = status.active_sessions {
                        println!("Active sessions: {}", active);
                    }
                    for agent in &status.agents {
                        println!("  - {}", agent);
                    }
                    if let Some(message) = &status.message {
                        println!("{}", message);
                    }
                }
                Err(e) => {
                    tracing::error!("Status check failed: {}", e);
                    eprintln!("Error: {}", e.inner);
                    std::process::exit(1);
                }
            }
        }
    }
}
