use crate::commands::Context;
use clap::Subcommand;
use clearsync_core::{
    format_units, Address, AppAllocation, AppSession, ClearsyncError, Result, U256,
};
use std::str::FromStr;

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Open an app session, staking part of the channel balance
    Open {
        /// Counterparty address
        counterparty: String,
        /// Stake in token units
        amount: String,
    },
    /// Show the open app session
    Show,
    /// Move funds inside the open session
    Update {
        /// Amount (token units) that the counterparty ends up holding
        #[arg(long)]
        to_counterparty: String,
    },
    /// Close the open session with a final split
    Close {
        /// Amount (token units) paid out to the counterparty
        #[arg(long, default_value = "0")]
        to_counterparty: String,
    },
}

/// Split the session total so the counterparty holds exactly `theirs`.
fn split(session: &AppSession, own: Address, theirs: U256) -> Result<Vec<AppAllocation>> {
    let total = session.total();
    if theirs > total {
        return Err(ClearsyncError::validation(format!(
            "Session only holds {}",
            total
        )));
    }
    let counterparty = session
        .participants
        .iter()
        .copied()
        .find(|p| *p != own)
        .ok_or_else(|| ClearsyncError::invalid_state("Session has no counterparty"))?;

    Ok(vec![
        AppAllocation {
            participant: own,
            amount: total - theirs,
        },
        AppAllocation {
            participant: counterparty,
            amount: theirs,
        },
    ])
}

pub async fn handle_session_command(cmd: SessionCommands, context: &Context) -> Result<()> {
    let decimals = context.config.client.token_decimals;
    let symbol = &context.config.client.token_symbol;

    match cmd {
        SessionCommands::Open {
            counterparty,
            amount,
        } => {
            let counterparty = Address::from_str(&counterparty)
                .map_err(|e| ClearsyncError::validation(format!("Invalid address: {}", e)))?;
            let amount = context.parse_amount(&amount)?;
            let client = context.connected_client().await?;

            let session = client.open_app_session(counterparty, amount).await?;
            println!("App session opened!");
            println!("  ID: {:?}", session.app_session_id);
            println!("  Stake: {} {}", format_units(amount, decimals), symbol);
        }

        SessionCommands::Show => {
            let client = context.client().await?;
            let Some(session) = client.app_session().await? else {
                println!("No open app session.");
                return Ok(());
            };
            println!("App session {:?} (version {})", session.app_session_id, session.version);
            for allocation in &session.allocations {
                println!(
                    "  {:?}: {} {}",
                    allocation.participant,
                    format_units(allocation.amount, decimals),
                    symbol
                );
            }
        }

        SessionCommands::Update { to_counterparty } => {
            let theirs = context.parse_amount(&to_counterparty)?;
            let client = context.connected_client().await?;
            let session = client
                .app_session()
                .await?
                .ok_or_else(|| ClearsyncError::invalid_state("No open app session"))?;

            let allocations = split(&session, client.wallet_address(), theirs)?;
            let updated = client.submit_app_state(allocations).await?;
            println!("App session at version {}", updated.version);
        }

        SessionCommands::Close { to_counterparty } => {
            let theirs = context.parse_amount(&to_counterparty)?;
            let client = context.connected_client().await?;
            let session = client
                .app_session()
                .await?
                .ok_or_else(|| ClearsyncError::invalid_state("No open app session"))?;

            let allocations = split(&session, client.wallet_address(), theirs)?;
            client.close_app_session(allocations).await?;
            println!("App session closed.");
            println!("  {}", client.status_line());
        }
    }

    Ok(())
}
