use clearsync_core::{
    format_units, parse_units, ChannelClient, ClientConfig, LocalWallet, Network, Storage,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let key = std::env::var("CLEARSYNC_PRIVATE_KEY")
        .map_err(|_| "set CLEARSYNC_PRIVATE_KEY to a funded wallet key")?;
    let wallet = Arc::new(LocalWallet::from_hex(&key)?);

    let config = ClientConfig::new(Network::Base);
    let data_dir = tempfile::tempdir()?;
    let storage = Arc::new(Storage::new(&data_dir.path().join("clearsync.db")).await?);

    let client = ChannelClient::with_evm_custody(config.clone(), wallet, storage).await?;
    let session = client.connect().await?;
    println!("Authenticated until {}", session.expires_at);

    let amount = parse_units("1.00", config.token_decimals)?;
    let opened = client.setup_channel(amount).await?;
    println!("Opened channel {:?}", opened.channel_id);
    println!("{}", client.status_line());

    for balance in client.ledger_balances().await? {
        println!("Ledger: {} {}", balance.amount, balance.asset);
    }

    let tx = client.close_channel().await?;
    println!("Closed in {:?}", tx);

    let custody = client.custody_balance().await?;
    println!(
        "Custody holds {} {}",
        format_units(custody, config.token_decimals),
        config.token_symbol
    );

    Ok(())
}
