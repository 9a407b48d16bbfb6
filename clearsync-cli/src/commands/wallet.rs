use crate::commands::{new_password, Context};
use clap::Subcommand;
use clearsync_core::{ClearsyncError, EncryptedKey, LocalWallet, Result, WalletSigner};
use comfy_table::{presets::UTF8_FULL, Table};
use dialoguer::{Confirm, Password};

#[derive(Subcommand)]
pub enum WalletCommands {
    /// Generate a new wallet key
    Create {
        /// Overwrite an existing keystore
        #[arg(short, long)]
        force: bool,
    },
    /// Import a wallet from a hex private key
    Import {
        /// Private key (will prompt if not provided)
        #[arg(short, long)]
        key: Option<String>,
        /// Overwrite an existing keystore
        #[arg(short, long)]
        force: bool,
    },
    /// Show the wallet address and keystore details
    Info,
}

async fn store(context: &Context, wallet: &LocalWallet, force: bool) -> Result<()> {
    let path = context.config.keystore_path();
    if tokio::fs::try_exists(&path).await? && !force {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "A wallet already exists at {}. Replace it? This cannot be undone.",
                path.display()
            ))
            .default(false)
            .interact()
            .map_err(|e| ClearsyncError::dialog(e.to_string()))?;
        if !confirm {
            return Err(ClearsyncError::validation("Existing wallet kept"));
        }
    }

    let password = new_password()?;
    EncryptedKey::encrypt(wallet, &password)?.save(&path).await
}

pub async fn handle_wallet_command(cmd: WalletCommands, context: &Context) -> Result<()> {
    match cmd {
        WalletCommands::Create { force } => {
            let wallet = LocalWallet::random();
            store(context, &wallet, force).await?;

            println!("Wallet created successfully!");
            println!("  Address: {:?}", wallet.address());
            println!("  Keystore: {}", context.config.keystore_path().display());
            println!();
            println!("Fund this address with {} before opening a channel.", context.config.client.token_symbol);
        }

        WalletCommands::Import { key, force } => {
            let key = match key {
                Some(key) => key,
                None => Password::new()
                    .with_prompt("Enter private key (hex)")
                    .interact()
                    .map_err(|e| ClearsyncError::dialog(e.to_string()))?,
            };
            let wallet = LocalWallet::from_hex(&key)?;
            store(context, &wallet, force).await?;

            println!("Wallet imported successfully!");
            println!("  Address: {:?}", wallet.address());
        }

        WalletCommands::Info => {
            let keystore = EncryptedKey::load(&context.config.keystore_path()).await?;

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Field", "Value"]);
            table.add_row(vec!["Address".to_string(), format!("{:?}", keystore.address)]);
            table.add_row(vec!["Network".to_string(), context.config.client.network.to_string()]);
            table.add_row(vec!["Encryption".to_string(), keystore.encryption_method.clone()]);
            table.add_row(vec!["Created".to_string(), keystore.created_at.to_rfc3339()]);
            println!("{}", table);
        }
    }

    Ok(())
}
