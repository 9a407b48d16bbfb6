use crate::commands::Context;
use clap::Subcommand;
use clearsync_core::Result;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the active configuration
    Show,
    /// Write the active configuration (network preset included) to disk
    Init,
    /// Change one setting, e.g. `coordinator_url=wss://...`
    Set {
        /// Config key
        key: String,
        /// New value
        value: String,
    },
}

pub async fn handle_config_command(cmd: ConfigCommands, mut context: Context) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            println!("Config file: {}", context.config.config_path().display());
            println!("{}", serde_json::to_string_pretty(&context.config.client)?);
            if let Err(e) = context.config.client.validate() {
                println!();
                println!("Warning: {}", e);
            }
        }

        ConfigCommands::Init => {
            context.config.save().await?;
            println!(
                "Wrote {} config to {}",
                context.config.client.network,
                context.config.config_path().display()
            );
        }

        ConfigCommands::Set { key, value } => {
            context.config.set(&key, &value)?;
            context.config.save().await?;
            println!("{} updated.", key);
        }
    }

    Ok(())
}
