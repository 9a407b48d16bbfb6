use crate::commands::Context;
use clap::Subcommand;
use clearsync_core::{format_units, Result};

#[derive(Subcommand)]
pub enum CustodyCommands {
    /// Show funds held by the custody contract for this wallet
    Balance,
    /// Withdraw custody funds back to the wallet
    Withdraw {
        /// Amount in token units (defaults to the whole balance)
        amount: Option<String>,
    },
}

pub async fn handle_custody_command(cmd: CustodyCommands, context: &Context) -> Result<()> {
    let decimals = context.config.client.token_decimals;
    let symbol = &context.config.client.token_symbol;
    let client = context.client().await?;

    match cmd {
        CustodyCommands::Balance => {
            let balance = client.custody_balance().await?;
            println!("Custody balance for {:?}:", client.wallet_address());
            println!("  {} {}", format_units(balance, decimals), symbol);
        }

        CustodyCommands::Withdraw { amount } => {
            let amount = amount.map(|a| context.parse_amount(&a)).transpose()?;
            println!("Withdrawing from custody...");
            let tx_hash = client.withdraw(amount).await?;
            println!("Withdrawal confirmed in tx {:?}", tx_hash);
            let remaining = client.custody_balance().await?;
            println!("Remaining custody balance: {} {}", format_units(remaining, decimals), symbol);
        }
    }

    Ok(())
}
