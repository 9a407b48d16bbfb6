use crate::commands::Context;
use clap::Subcommand;
use clearsync_core::{format_units, ChannelId, ClearsyncError, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use std::str::FromStr;

#[derive(Subcommand)]
pub enum ChannelCommands {
    /// Create a channel with the coordinator and fund it
    Open {
        /// Amount in token units, e.g. 10.5
        amount: String,
    },
    /// Deposit more funds into the open channel
    Fund {
        /// Amount in token units
        amount: String,
    },
    /// Cooperatively close the channel; funds return to custody
    Close,
    /// Show the locally known channel
    Status,
    /// Reconcile the channel with the custody contract after a failure
    Resume {
        /// Channel id (defaults to the latest unclosed channel)
        channel_id: Option<String>,
    },
    /// List channels the custody contract holds open for this wallet
    List,
    /// Show off-chain ledger balances reported by the coordinator
    Balances,
}

pub async fn handle_channel_command(cmd: ChannelCommands, context: &Context) -> Result<()> {
    let decimals = context.config.client.token_decimals;
    let symbol = &context.config.client.token_symbol;

    match cmd {
        ChannelCommands::Open { amount } => {
            let amount = context.parse_amount(&amount)?;
            let client = context.connected_client().await?;

            println!("Opening channel with {} {}...", format_units(amount, decimals), symbol);
            let opened = client.setup_channel(amount).await?;
            println!("Channel opened!");
            println!("  Channel ID: {:?}", opened.channel_id);
            println!("  Creation tx: {:?}", opened.tx_hash);
            println!("  {}", client.status_line());
        }

        ChannelCommands::Fund { amount } => {
            let amount = context.parse_amount(&amount)?;
            let client = context.connected_client().await?;

            println!("Adding {} {} to the channel...", format_units(amount, decimals), symbol);
            client.add_funds(amount).await?;
            println!("  {}", client.status_line());
        }

        ChannelCommands::Close => {
            let client = context.connected_client().await?;

            println!("Closing channel...");
            let tx_hash = client.close_channel().await?;
            println!("Channel closed in tx {:?}", tx_hash);
            let custody = client.custody_balance().await?;
            println!(
                "Custody balance: {} {} (withdraw with 'clearsync custody withdraw')",
                format_units(custody, decimals),
                symbol
            );
        }

        ChannelCommands::Status => {
            let client = context.client().await?;
            let Some(record) = client.lifecycle().record() else {
                println!("No channel found.");
                println!("Open one with: clearsync channel open <amount>");
                return Ok(());
            };

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Field", "Value"]);
            table.add_row(vec!["Channel".to_string(), format!("{:?}", record.channel_id())]);
            table.add_row(vec!["Status".to_string(), record.status().to_string()]);
            table.add_row(vec!["Progress".to_string(), record.phase.to_string()]);
            table.add_row(vec!["Version".to_string(), record.channel.version.to_string()]);
            table.add_row(vec![
                "Balance".to_string(),
                format!(
                    "{} {}",
                    format_units(record.channel.balance_of(client.wallet_address()), decimals),
                    symbol
                ),
            ]);
            table.add_row(vec![
                "Coordinator".to_string(),
                format!("{:?}", record.channel.definition.coordinator()),
            ]);
            if let Some(tx) = record.pending_tx {
                table.add_row(vec!["Pending tx".to_string(), format!("{:?}", tx)]);
            }
            table.add_row(vec!["Updated".to_string(), record.updated_at.to_rfc3339()]);
            println!("{}", table);

            if let Some(session) = client.app_session().await? {
                println!(
                    "Open app session {:?} at version {}",
                    session.app_session_id, session.version
                );
            }
        }

        ChannelCommands::Resume { channel_id } => {
            let channel_id = channel_id
                .as_deref()
                .map(ChannelId::from_str)
                .transpose()
                .map_err(|e| ClearsyncError::validation(format!("Invalid channel id: {}", e)))?;
            let client = context.client().await?;

            println!("Reconciling with the custody contract...");
            let channel = client.resume(channel_id).await?;
            println!("Channel {:?} is {}", channel.channel_id, channel.status);
            println!("  {}", client.status_line());
        }

        ChannelCommands::List => {
            let client = context.client().await?;
            let channels = client.open_channels().await?;
            if channels.is_empty() {
                println!("No open channels for {:?}.", client.wallet_address());
                return Ok(());
            }
            for channel_id in channels {
                println!("{:?}", channel_id);
            }
        }

        ChannelCommands::Balances => {
            let client = context.connected_client().await?;
            let balances = client.ledger_balances().await?;
            if balances.is_empty() {
                println!("No ledger balances.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Asset", "Amount"]);
            for balance in balances {
                table.add_row(vec![balance.asset, balance.amount]);
            }
            println!("{}", table);
        }
    }

    Ok(())
}
